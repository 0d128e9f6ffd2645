//! Host probes.
//!
//! [`SystemProbe`] reads CPU and memory pressure through `sysinfo` and
//! derives a device tier from core count and installed memory. Network and
//! battery signals are not observable here and are left to the embedding
//! host (see [`FixedProbe`] and custom [`TelemetryProbe`] implementations).

use std::sync::Mutex;

use sysinfo::System;

use super::{DeviceTier, ProbeReading, TelemetryProbe};

const GIB: u64 = 1_073_741_824;

/// CPU/memory probe backed by `sysinfo`.
pub struct SystemProbe {
    // Kept across reads: CPU usage is a delta between two refreshes.
    sys: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        SystemProbe {
            sys: Mutex::new(sys),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryProbe for SystemProbe {
    fn read(&self) -> ProbeReading {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let cpu = sys.global_cpu_usage() as f64;
        let total = sys.total_memory();
        let memory = if total > 0 {
            Some(sys.used_memory() as f64 / total as f64 * 100.0)
        } else {
            None
        };

        ProbeReading {
            cpu_load_pct: cpu.is_finite().then_some(cpu),
            memory_usage_pct: memory,
            device_tier: Some(device_tier(sys.cpus().len(), total)),
            ..Default::default()
        }
    }
}

fn device_tier(cores: usize, total_memory_bytes: u64) -> DeviceTier {
    if cores <= 2 || total_memory_bytes < 2 * GIB {
        DeviceTier::Low
    } else if cores >= 8 && total_memory_bytes >= 8 * GIB {
        DeviceTier::High
    } else {
        DeviceTier::Mid
    }
}

/// Probe returning a caller-controlled reading. Used for hosts that push
/// their own signals, for the simulator and for tests.
pub struct FixedProbe {
    reading: Mutex<ProbeReading>,
}

impl FixedProbe {
    pub fn new(reading: ProbeReading) -> Self {
        FixedProbe {
            reading: Mutex::new(reading),
        }
    }

    pub fn set(&self, reading: ProbeReading) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = reading;
    }

    pub fn update(&self, f: impl FnOnce(&mut ProbeReading)) {
        f(&mut self.reading.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

impl TelemetryProbe for FixedProbe {
    fn read(&self) -> ProbeReading {
        self.reading
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
