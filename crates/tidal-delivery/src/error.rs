//! Error types shared across the delivery controller.

use thiserror::Error;

/// Rejected configuration. Raised at load time, never at decision time.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("{name} thresholds must be strictly increasing, got {low} then {high}")]
    InvertedThresholds { name: &'static str, low: f64, high: f64 },
    #[error("{name} must be within [{min}, {max}), got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },
    #[error("aggressive weights must sum to 1.0, got {0:.3}")]
    WeightSum(f64),
}

/// Failure reported by the audio/content pipeline when applying a profile.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("pipeline rejected profile {profile}: {message}")]
pub struct PipelineError {
    pub profile: String,
    pub message: String,
}

/// A single failed transfer attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache ceiling of {ceiling} bytes")]
    TooLarge { size: u64, ceiling: u64 },
    #[error("cannot free {needed} bytes: remaining entries are pinned by in-flight transfers")]
    Pinned { needed: u64 },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(String),
    #[error("invalid value {value:?} for setting {key}")]
    InvalidValue { key: String, value: String },
}
