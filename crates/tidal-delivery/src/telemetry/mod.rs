//! # Runtime Telemetry
//!
//! Point-in-time reads of network, compute and power conditions. Probes
//! report whatever they can observe; anything missing is filled with a
//! neutral mid-range value so downstream classification is always total.

pub mod monitor;
pub mod system;

use serde::{Deserialize, Serialize};

/// Connectivity class reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    Offline,
    Slow2g,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Cellular5g,
    Wifi,
    Ethernet,
    #[default]
    Unknown,
}

/// Coarse capability tier of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    Low,
    #[default]
    Mid,
    High,
}

/// Discrete host events that force an immediate re-probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    NetworkChanged,
    BatteryChanged,
    ChargingChanged,
    VisibilityChanged,
}

/// Immutable telemetry snapshot. Superseded, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    /// Smoothed throughput estimate (kbps).
    pub bandwidth_kbps: f64,
    /// Latest raw throughput measurement (kbps).
    pub measured_kbps: f64,
    pub rtt_ms: f64,
    pub network_class: NetworkClass,
    pub data_saver: bool,
    pub cpu_load_pct: f64,
    pub memory_usage_pct: f64,
    pub battery_pct: f64,
    pub is_charging: bool,
    pub device_tier: DeviceTier,
    /// Monotonic sequence number assigned by the monitor.
    pub sequence: u64,
}

impl TelemetrySnapshot {
    pub const NEUTRAL_BANDWIDTH_KBPS: f64 = 1_000.0;
    pub const NEUTRAL_RTT_MS: f64 = 100.0;
    pub const NEUTRAL_CPU_PCT: f64 = 45.0;
    pub const NEUTRAL_MEMORY_PCT: f64 = 55.0;
    pub const NEUTRAL_BATTERY_PCT: f64 = 65.0;

    /// Snapshot with every dimension at its neutral mid-range value.
    pub fn neutral() -> Self {
        TelemetrySnapshot {
            bandwidth_kbps: Self::NEUTRAL_BANDWIDTH_KBPS,
            measured_kbps: Self::NEUTRAL_BANDWIDTH_KBPS,
            rtt_ms: Self::NEUTRAL_RTT_MS,
            network_class: NetworkClass::Unknown,
            data_saver: false,
            cpu_load_pct: Self::NEUTRAL_CPU_PCT,
            memory_usage_pct: Self::NEUTRAL_MEMORY_PCT,
            battery_pct: Self::NEUTRAL_BATTERY_PCT,
            is_charging: false,
            device_tier: DeviceTier::Mid,
            sequence: 0,
        }
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Partial observation from a probe. `None` means the signal was unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReading {
    pub bandwidth_kbps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub network_class: Option<NetworkClass>,
    pub data_saver: Option<bool>,
    pub cpu_load_pct: Option<f64>,
    pub memory_usage_pct: Option<f64>,
    pub battery_pct: Option<f64>,
    pub is_charging: Option<bool>,
    pub device_tier: Option<DeviceTier>,
}

/// Host signal source. Implementations must not panic; an unavailable
/// signal is reported as `None`.
pub trait TelemetryProbe: Send + Sync {
    fn read(&self) -> ProbeReading;
}

impl<P: TelemetryProbe + ?Sized> TelemetryProbe for std::sync::Arc<P> {
    fn read(&self) -> ProbeReading {
        (**self).read()
    }
}
