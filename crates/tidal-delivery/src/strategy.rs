//! # Bandwidth Strategy Selection
//!
//! Maps connectivity to a named transfer policy. Precedence:
//!
//! 1. data-saver hint → the most restrictive strategy
//! 2. smoothed bandwidth below the floor → `degraded`
//! 3. otherwise dispatch on the network class
//!
//! Strategies are static constants. The selector only remembers the last
//! choice so it can report changes.

use serde::Serialize;
use tracing::info;

use crate::config::StrategyConfig;
use crate::telemetry::{NetworkClass, TelemetrySnapshot};

/// Transfer policy for the current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Strategy {
    pub name: &'static str,
    /// Ceiling for the applied quality profile's bitrate (kbps).
    pub max_bitrate_kbps: u32,
    /// 0 (none) ..= 9 (maximum).
    pub compression_level: u8,
    pub allow_preload: bool,
    pub adaptive_streaming: bool,
    /// Hold `low` priority transfers while this strategy is active.
    pub prioritize_essential: bool,
}

pub const DATA_SAVER: Strategy = Strategy {
    name: "data-saver",
    max_bitrate_kbps: 48,
    compression_level: 9,
    allow_preload: false,
    adaptive_streaming: true,
    prioritize_essential: true,
};

pub const DEGRADED: Strategy = Strategy {
    name: "degraded",
    max_bitrate_kbps: 64,
    compression_level: 8,
    allow_preload: false,
    adaptive_streaming: true,
    prioritize_essential: true,
};

pub const CELLULAR_2G: Strategy = Strategy {
    name: "cellular-2g",
    max_bitrate_kbps: 64,
    compression_level: 7,
    allow_preload: false,
    adaptive_streaming: true,
    prioritize_essential: true,
};

pub const CELLULAR_3G: Strategy = Strategy {
    name: "cellular-3g",
    max_bitrate_kbps: 128,
    compression_level: 5,
    allow_preload: false,
    adaptive_streaming: true,
    prioritize_essential: false,
};

pub const CELLULAR_4G: Strategy = Strategy {
    name: "cellular-4g",
    max_bitrate_kbps: 256,
    compression_level: 3,
    allow_preload: true,
    adaptive_streaming: true,
    prioritize_essential: false,
};

pub const BROADBAND: Strategy = Strategy {
    name: "broadband",
    max_bitrate_kbps: 320,
    compression_level: 1,
    allow_preload: true,
    adaptive_streaming: false,
    prioritize_essential: false,
};

/// Strategy for a network class alone, ignoring hints and bandwidth.
pub fn for_network(class: NetworkClass) -> Strategy {
    match class {
        NetworkClass::Offline | NetworkClass::Slow2g | NetworkClass::Cellular2g => CELLULAR_2G,
        NetworkClass::Cellular3g | NetworkClass::Unknown => CELLULAR_3G,
        NetworkClass::Cellular4g => CELLULAR_4G,
        NetworkClass::Cellular5g | NetworkClass::Wifi | NetworkClass::Ethernet => BROADBAND,
    }
}

pub struct StrategySelector {
    config: StrategyConfig,
    current: Option<Strategy>,
}

impl StrategySelector {
    pub fn new(config: StrategyConfig) -> Self {
        StrategySelector {
            config,
            current: None,
        }
    }

    /// Pure selection for a snapshot.
    pub fn select(&self, snapshot: &TelemetrySnapshot) -> Strategy {
        if snapshot.data_saver {
            DATA_SAVER
        } else if snapshot.bandwidth_kbps < self.config.low_bandwidth_floor_kbps {
            DEGRADED
        } else {
            for_network(snapshot.network_class)
        }
    }

    /// Select and remember. Returns `Some` only when the strategy changed.
    pub fn update(&mut self, snapshot: &TelemetrySnapshot) -> Option<Strategy> {
        let next = self.select(snapshot);
        if self.current == Some(next) {
            return None;
        }
        info!(
            from = self.current.map(|s| s.name).unwrap_or("none"),
            to = next.name,
            "transfer strategy changed"
        );
        self.current = Some(next);
        Some(next)
    }

    /// Last selected strategy, `cellular-3g` before any telemetry.
    pub fn current(&self) -> Strategy {
        self.current.unwrap_or(CELLULAR_3G)
    }
}
