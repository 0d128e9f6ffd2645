use std::time::Duration;

use serde::Deserialize;

use crate::adaptation::{AdaptationMode, Algorithm, UserBias};
use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

// ─── Input (TOML) ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryConfigInput {
    pub version: u32,
    pub telemetry: TelemetryConfigInput,
    pub adaptation: AdaptationConfigInput,
    pub strategy: StrategyConfigInput,
    pub scheduler: SchedulerConfigInput,
    pub cache: CacheConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub poll_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub bandwidth_decay: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct BucketThresholdsInput {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdaptationConfigInput {
    pub bandwidth_kbps: BucketThresholdsInput,
    pub cpu_pct: BucketThresholdsInput,
    pub memory_pct: BucketThresholdsInput,
    pub battery_pct: BucketThresholdsInput,
    pub level_low_max: Option<f64>,
    pub level_medium_max: Option<f64>,
    pub level_high_max: Option<f64>,
    pub weight_bandwidth: Option<f64>,
    pub weight_cpu: Option<f64>,
    pub weight_memory: Option<f64>,
    pub weight_battery: Option<f64>,
    pub quality_bias_weight: Option<f64>,
    pub efficiency_bias_weight: Option<f64>,
    pub algorithm: Option<Algorithm>,
    pub mode: Option<AdaptationMode>,
    pub user_bias: Option<UserBias>,
    pub history_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StrategyConfigInput {
    pub low_bandwidth_floor_kbps: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub reserved_fraction: Option<f64>,
    pub max_retries: Option<u32>,
    pub retry_ledger_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfigInput {
    pub max_size_bytes: Option<i64>,
    pub max_age_secs: Option<i64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub poll_interval: Duration,
    /// Upper bound a refresh waits for the probe before reusing the last snapshot.
    pub probe_timeout: Duration,
    /// Weight of the previous bandwidth estimate in the decayed average.
    pub bandwidth_decay: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(50),
            bandwidth_decay: 0.95,
        }
    }
}

/// Two cut points splitting a dimension into low / medium / high.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketThresholds {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationThresholds {
    /// `< low` → low, `< high` → medium, otherwise high.
    pub bandwidth_kbps: BucketThresholds,
    /// `<= low` → low, `<= high` → medium, otherwise high.
    pub cpu_pct: BucketThresholds,
    /// `<= low` → low, `<= high` → medium, otherwise high.
    pub memory_pct: BucketThresholds,
    /// `>= high` → high, `>= low` → medium, otherwise low.
    pub battery_pct: BucketThresholds,
}

impl Default for ClassificationThresholds {
    fn default() -> Self {
        ClassificationThresholds {
            bandwidth_kbps: BucketThresholds {
                low: 500.0,
                high: 1_500.0,
            },
            cpu_pct: BucketThresholds {
                low: 30.0,
                high: 60.0,
            },
            memory_pct: BucketThresholds {
                low: 40.0,
                high: 70.0,
            },
            battery_pct: BucketThresholds {
                low: 50.0,
                high: 80.0,
            },
        }
    }
}

/// Score → level cut points: `<= low_max` → low, `<= medium_max` → medium,
/// `<= high_max` → high, otherwise ultra.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelThresholds {
    pub low_max: f64,
    pub medium_max: f64,
    pub high_max: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        LevelThresholds {
            low_max: 1.3,
            medium_max: 2.0,
            high_max: 2.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggressiveWeights {
    pub bandwidth: f64,
    pub cpu: f64,
    pub memory: f64,
    pub battery: f64,
}

impl AggressiveWeights {
    pub fn sum(&self) -> f64 {
        self.bandwidth + self.cpu + self.memory + self.battery
    }
}

impl Default for AggressiveWeights {
    fn default() -> Self {
        AggressiveWeights {
            bandwidth: 0.4,
            cpu: 0.3,
            memory: 0.2,
            battery: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationConfig {
    pub thresholds: ClassificationThresholds,
    pub levels: LevelThresholds,
    pub weights: AggressiveWeights,
    /// Hybrid interpolation weight toward the aggressive candidate when
    /// the user prioritizes quality.
    pub quality_bias_weight: f64,
    /// Same, when the user prioritizes efficiency.
    pub efficiency_bias_weight: f64,
    pub algorithm: Algorithm,
    pub mode: AdaptationMode,
    pub user_bias: UserBias,
    pub history_capacity: usize,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        AdaptationConfig {
            thresholds: ClassificationThresholds::default(),
            levels: LevelThresholds::default(),
            weights: AggressiveWeights::default(),
            quality_bias_weight: 0.7,
            efficiency_bias_weight: 0.3,
            algorithm: Algorithm::Hybrid,
            mode: AdaptationMode::Automatic,
            user_bias: UserBias::Efficiency,
            history_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    /// Measured bandwidth below this selects the degraded strategy.
    pub low_bandwidth_floor_kbps: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            low_bandwidth_floor_kbps: 150.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Share of measured bandwidth never handed to transfers.
    pub reserved_fraction: f64,
    /// Retries after the first failed attempt before a request is dropped.
    pub max_retries: u32,
    /// Dropped or cancelled ids whose retry count is remembered for re-adds.
    /// Oldest entries are forgotten first.
    pub retry_ledger_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            reserved_fraction: 0.2,
            max_retries: 3,
            retry_ledger_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size_bytes: 64 * 1024 * 1024,
            max_age: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryConfig {
    pub telemetry: TelemetryConfig,
    pub adaptation: AdaptationConfig,
    pub strategy: StrategyConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

fn bucket(input: BucketThresholdsInput, default: BucketThresholds) -> BucketThresholds {
    BucketThresholds {
        low: input.low.unwrap_or(default.low),
        high: input.high.unwrap_or(default.high),
    }
}

impl DeliveryConfigInput {
    pub fn resolve(self) -> Result<DeliveryConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let t = TelemetryConfig::default();
        let telemetry = TelemetryConfig {
            poll_interval: self
                .telemetry
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(t.poll_interval),
            probe_timeout: self
                .telemetry
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(t.probe_timeout),
            bandwidth_decay: self.telemetry.bandwidth_decay.unwrap_or(t.bandwidth_decay),
        };

        let a = AdaptationConfig::default();
        let ai = self.adaptation;
        let adaptation = AdaptationConfig {
            thresholds: ClassificationThresholds {
                bandwidth_kbps: bucket(ai.bandwidth_kbps, a.thresholds.bandwidth_kbps),
                cpu_pct: bucket(ai.cpu_pct, a.thresholds.cpu_pct),
                memory_pct: bucket(ai.memory_pct, a.thresholds.memory_pct),
                battery_pct: bucket(ai.battery_pct, a.thresholds.battery_pct),
            },
            levels: LevelThresholds {
                low_max: ai.level_low_max.unwrap_or(a.levels.low_max),
                medium_max: ai.level_medium_max.unwrap_or(a.levels.medium_max),
                high_max: ai.level_high_max.unwrap_or(a.levels.high_max),
            },
            weights: AggressiveWeights {
                bandwidth: ai.weight_bandwidth.unwrap_or(a.weights.bandwidth),
                cpu: ai.weight_cpu.unwrap_or(a.weights.cpu),
                memory: ai.weight_memory.unwrap_or(a.weights.memory),
                battery: ai.weight_battery.unwrap_or(a.weights.battery),
            },
            quality_bias_weight: ai.quality_bias_weight.unwrap_or(a.quality_bias_weight),
            efficiency_bias_weight: ai
                .efficiency_bias_weight
                .unwrap_or(a.efficiency_bias_weight),
            algorithm: ai.algorithm.unwrap_or(a.algorithm),
            mode: ai.mode.unwrap_or(a.mode),
            user_bias: ai.user_bias.unwrap_or(a.user_bias),
            history_capacity: ai.history_capacity.unwrap_or(a.history_capacity),
        };

        let strategy = StrategyConfig {
            low_bandwidth_floor_kbps: self
                .strategy
                .low_bandwidth_floor_kbps
                .unwrap_or(StrategyConfig::default().low_bandwidth_floor_kbps),
        };

        let s = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            reserved_fraction: self.scheduler.reserved_fraction.unwrap_or(s.reserved_fraction),
            max_retries: self.scheduler.max_retries.unwrap_or(s.max_retries),
            retry_ledger_capacity: self
                .scheduler
                .retry_ledger_capacity
                .unwrap_or(s.retry_ledger_capacity),
        };

        let c = CacheConfig::default();
        let cache = CacheConfig {
            max_size_bytes: match self.cache.max_size_bytes {
                Some(v) if v <= 0 => {
                    return Err(ConfigError::NonPositive {
                        name: "cache.max_size_bytes",
                    });
                }
                Some(v) => v as u64,
                None => c.max_size_bytes,
            },
            max_age: match self.cache.max_age_secs {
                Some(v) if v <= 0 => {
                    return Err(ConfigError::NonPositive {
                        name: "cache.max_age_secs",
                    });
                }
                Some(v) => Duration::from_secs(v as u64),
                None => c.max_age,
            },
        };

        let config = DeliveryConfig {
            telemetry,
            adaptation,
            strategy,
            scheduler,
            cache,
        };
        config.validate()?;
        Ok(config)
    }
}

fn increasing(name: &'static str, low: f64, high: f64) -> Result<(), ConfigError> {
    if low.is_finite() && high.is_finite() && low < high {
        Ok(())
    } else {
        Err(ConfigError::InvertedThresholds { name, low, high })
    }
}

fn in_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value < max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

impl DeliveryConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(DeliveryConfig::default());
        }
        let parsed: DeliveryConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    /// Reject inverted thresholds, out-of-range fractions and empty sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.poll_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "telemetry.poll_interval_ms",
            });
        }
        if self.telemetry.probe_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "telemetry.probe_timeout_ms",
            });
        }
        in_range(
            "telemetry.bandwidth_decay",
            self.telemetry.bandwidth_decay,
            0.0,
            1.0,
        )?;

        let th = &self.adaptation.thresholds;
        in_range("adaptation.bandwidth_kbps.low", th.bandwidth_kbps.low, 0.0, f64::MAX)?;
        increasing(
            "adaptation.bandwidth_kbps",
            th.bandwidth_kbps.low,
            th.bandwidth_kbps.high,
        )?;
        for (name, b) in [
            ("adaptation.cpu_pct", th.cpu_pct),
            ("adaptation.memory_pct", th.memory_pct),
            ("adaptation.battery_pct", th.battery_pct),
        ] {
            increasing(name, b.low, b.high)?;
            in_range(name, b.low, 0.0, 100.0)?;
            in_range(name, b.high, 0.0, 100.000_1)?;
        }

        let lv = &self.adaptation.levels;
        increasing("adaptation.level_low_max", lv.low_max, lv.medium_max)?;
        increasing("adaptation.level_medium_max", lv.medium_max, lv.high_max)?;

        let w = &self.adaptation.weights;
        for (name, v) in [
            ("adaptation.weight_bandwidth", w.bandwidth),
            ("adaptation.weight_cpu", w.cpu),
            ("adaptation.weight_memory", w.memory),
            ("adaptation.weight_battery", w.battery),
        ] {
            in_range(name, v, 0.0, 1.000_1)?;
        }
        if (w.sum() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::WeightSum(w.sum()));
        }
        in_range(
            "adaptation.quality_bias_weight",
            self.adaptation.quality_bias_weight,
            0.0,
            1.000_1,
        )?;
        in_range(
            "adaptation.efficiency_bias_weight",
            self.adaptation.efficiency_bias_weight,
            0.0,
            1.000_1,
        )?;
        if self.adaptation.history_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "adaptation.history_capacity",
            });
        }

        in_range(
            "strategy.low_bandwidth_floor_kbps",
            self.strategy.low_bandwidth_floor_kbps,
            0.0,
            f64::MAX,
        )?;
        in_range(
            "scheduler.reserved_fraction",
            self.scheduler.reserved_fraction,
            0.0,
            1.0,
        )?;
        if self.scheduler.retry_ledger_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "scheduler.retry_ledger_capacity",
            });
        }
        if self.cache.max_size_bytes == 0 {
            return Err(ConfigError::NonPositive {
                name: "cache.max_size_bytes",
            });
        }
        if self.cache.max_age.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "cache.max_age_secs",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = DeliveryConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg, DeliveryConfig::default());
        assert_eq!(cfg.scheduler.reserved_fraction, 0.2);
        assert_eq!(cfg.telemetry.bandwidth_decay, 0.95);
        assert_eq!(cfg.adaptation.history_capacity, 50);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [telemetry]
            poll_interval_ms = 10000
            bandwidth_decay = 0.9

            [adaptation]
            algorithm = "conservative"
            mode = "manual"
            user_bias = "quality"
            bandwidth_kbps = { low = 300, high = 2000 }

            [scheduler]
            reserved_fraction = 0.25
            max_retries = 5

            [cache]
            max_size_bytes = 1048576
            max_age_secs = 60
        "#;

        let cfg = DeliveryConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.telemetry.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.telemetry.bandwidth_decay, 0.9);
        assert_eq!(cfg.adaptation.algorithm, Algorithm::Conservative);
        assert_eq!(cfg.adaptation.mode, AdaptationMode::Manual);
        assert_eq!(cfg.adaptation.user_bias, UserBias::Quality);
        assert_eq!(cfg.adaptation.thresholds.bandwidth_kbps.low, 300.0);
        assert_eq!(cfg.adaptation.thresholds.bandwidth_kbps.high, 2_000.0);
        // untouched dimension keeps defaults
        assert_eq!(cfg.adaptation.thresholds.cpu_pct.low, 30.0);
        assert_eq!(cfg.scheduler.max_retries, 5);
        assert_eq!(cfg.cache.max_size_bytes, 1_048_576);
        assert_eq!(cfg.cache.max_age, Duration::from_secs(60));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let toml = r#"
            [adaptation]
            cpu_pct = { low = 70, high = 40 }
        "#;
        let err = DeliveryConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvertedThresholds {
                name: "adaptation.cpu_pct",
                ..
            }
        ));
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn rejects_negative_sizes() {
        let err = DeliveryConfig::from_toml_str("[cache]\nmax_size_bytes = -5").unwrap_err();
        assert_eq!(
            err,
            ConfigError::NonPositive {
                name: "cache.max_size_bytes"
            }
        );
    }

    #[test]
    fn rejects_bad_fractions_and_weights() {
        let err =
            DeliveryConfig::from_toml_str("[scheduler]\nreserved_fraction = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));

        let err =
            DeliveryConfig::from_toml_str("[adaptation]\nweight_bandwidth = 0.9").unwrap_err();
        assert!(matches!(err, ConfigError::WeightSum(_)));

        let err =
            DeliveryConfig::from_toml_str("[adaptation]\nlevel_medium_max = 3.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvertedThresholds { .. }));
    }

    #[test]
    fn rejects_unknown_version_and_garbage() {
        assert_eq!(
            DeliveryConfig::from_toml_str("version = 7").unwrap_err(),
            ConfigError::UnsupportedVersion(7)
        );
        assert!(matches!(
            DeliveryConfig::from_toml_str("[cache").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }
}
