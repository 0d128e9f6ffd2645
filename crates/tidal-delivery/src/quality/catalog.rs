//! # Quality Catalog
//!
//! Static table of the named quality tiers. Each profile carries encoding
//! parameters and a feature table; features marked [`FeatureSetting::Auto`]
//! are resolved against live conditions by [`super::features::resolve`].
//!
//! `adaptive` has no fixed parameters: [`adaptive_profile`] builds it at
//! decision time from a concrete base tier.

use serde::{Deserialize, Serialize};

/// Processing features a profile can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureName {
    SpatialAudio,
    Reverb,
    Equalizer,
    NoiseSuppression,
    DynamicCompression,
}

impl FeatureName {
    pub const COUNT: usize = 5;
    pub const ALL: [FeatureName; Self::COUNT] = [
        FeatureName::SpatialAudio,
        FeatureName::Reverb,
        FeatureName::Equalizer,
        FeatureName::NoiseSuppression,
        FeatureName::DynamicCompression,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSetting {
    Enabled,
    Disabled,
    Auto,
}

/// Quality tier. `Low..=Ultra` are ordinal; `Adaptive` is resolved per decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    Ultra,
    Adaptive,
}

impl QualityLevel {
    /// Ordinal tiers, lowest first.
    pub const ORDERED: [QualityLevel; 4] = [
        QualityLevel::Low,
        QualityLevel::Medium,
        QualityLevel::High,
        QualityLevel::Ultra,
    ];

    /// Ordinal index, `None` for `Adaptive`.
    pub fn index(self) -> Option<usize> {
        match self {
            QualityLevel::Low => Some(0),
            QualityLevel::Medium => Some(1),
            QualityLevel::High => Some(2),
            QualityLevel::Ultra => Some(3),
            QualityLevel::Adaptive => None,
        }
    }

    /// Tier at `index`, clamped to the ordinal range.
    pub fn from_index(index: usize) -> QualityLevel {
        Self::ORDERED[index.min(Self::ORDERED.len() - 1)]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityLevel::Low => "low",
            QualityLevel::Medium => "medium",
            QualityLevel::High => "high",
            QualityLevel::Ultra => "ultra",
            QualityLevel::Adaptive => "adaptive",
        }
    }

    pub fn parse(s: &str) -> Option<QualityLevel> {
        match s {
            "low" => Some(QualityLevel::Low),
            "medium" => Some(QualityLevel::Medium),
            "high" => Some(QualityLevel::High),
            "ultra" => Some(QualityLevel::Ultra),
            "adaptive" => Some(QualityLevel::Adaptive),
            _ => None,
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type FeatureTable = [(FeatureName, FeatureSetting); FeatureName::COUNT];

/// One fidelity tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityProfile {
    pub level: QualityLevel,
    pub bitrate_kbps: u32,
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub buffer_size: u32,
    pub features: FeatureTable,
    /// Relative CPU cost in [0, 1].
    pub processing_cost: f64,
    /// Relative memory cost in [0, 1].
    pub memory_cost: f64,
}

impl QualityProfile {
    pub fn id(&self) -> &'static str {
        self.level.as_str()
    }

    pub fn feature(&self, name: FeatureName) -> FeatureSetting {
        self.features
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .unwrap_or(FeatureSetting::Disabled)
    }
}

use FeatureName::*;
use FeatureSetting::*;

const LOW: QualityProfile = QualityProfile {
    level: QualityLevel::Low,
    bitrate_kbps: 64,
    sample_rate_hz: 22_050,
    channels: 1,
    buffer_size: 4_096,
    features: [
        (SpatialAudio, Disabled),
        (Reverb, Disabled),
        (Equalizer, Disabled),
        (NoiseSuppression, Auto),
        (DynamicCompression, Enabled),
    ],
    processing_cost: 0.1,
    memory_cost: 0.1,
};

const MEDIUM: QualityProfile = QualityProfile {
    level: QualityLevel::Medium,
    bitrate_kbps: 128,
    sample_rate_hz: 44_100,
    channels: 2,
    buffer_size: 2_048,
    features: [
        (SpatialAudio, Disabled),
        (Reverb, Disabled),
        (Equalizer, Auto),
        (NoiseSuppression, Auto),
        (DynamicCompression, Auto),
    ],
    processing_cost: 0.3,
    memory_cost: 0.3,
};

const HIGH: QualityProfile = QualityProfile {
    level: QualityLevel::High,
    bitrate_kbps: 256,
    sample_rate_hz: 48_000,
    channels: 2,
    buffer_size: 1_024,
    features: [
        (SpatialAudio, Auto),
        (Reverb, Auto),
        (Equalizer, Enabled),
        (NoiseSuppression, Auto),
        (DynamicCompression, Auto),
    ],
    processing_cost: 0.6,
    memory_cost: 0.5,
};

const ULTRA: QualityProfile = QualityProfile {
    level: QualityLevel::Ultra,
    bitrate_kbps: 320,
    sample_rate_hz: 96_000,
    channels: 2,
    buffer_size: 512,
    features: [
        (SpatialAudio, Auto),
        (Reverb, Auto),
        (Equalizer, Enabled),
        (NoiseSuppression, Enabled),
        (DynamicCompression, Disabled),
    ],
    processing_cost: 0.9,
    memory_cost: 0.8,
};

/// Catalog entry for a concrete tier. `Adaptive` returns `None`; use
/// [`adaptive_profile`] for it.
pub fn profile(level: QualityLevel) -> Option<&'static QualityProfile> {
    match level {
        QualityLevel::Low => Some(&LOW),
        QualityLevel::Medium => Some(&MEDIUM),
        QualityLevel::High => Some(&HIGH),
        QualityLevel::Ultra => Some(&ULTRA),
        QualityLevel::Adaptive => None,
    }
}

/// The four concrete catalog entries, lowest first.
pub fn catalog() -> [&'static QualityProfile; 4] {
    [&LOW, &MEDIUM, &HIGH, &ULTRA]
}

/// Build the `adaptive` profile from a concrete base tier: encoding
/// parameters follow the base, every feature is left to live conditions.
pub fn adaptive_profile(base: QualityLevel) -> QualityProfile {
    let base = profile(base).copied().unwrap_or(MEDIUM);
    QualityProfile {
        level: QualityLevel::Adaptive,
        features: FeatureName::ALL.map(|name| (name, Auto)),
        ..base
    }
}
