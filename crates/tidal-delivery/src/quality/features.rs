//! Feature gate resolution.
//!
//! Concrete settings pass through. `Auto` settings are decided by a fixed
//! per-feature rule over the categorized conditions. Stateless and
//! deterministic.

use std::collections::BTreeMap;

use super::catalog::{FeatureName, FeatureSetting, QualityProfile};
use crate::adaptation::{Bucket, CategorizedConditions};
use crate::telemetry::DeviceTier;

/// Resolve every feature of `profile` to a concrete on/off.
pub fn resolve(
    profile: &QualityProfile,
    conditions: &CategorizedConditions,
) -> BTreeMap<FeatureName, bool> {
    profile
        .features
        .iter()
        .map(|&(name, setting)| {
            let enabled = match setting {
                FeatureSetting::Enabled => true,
                FeatureSetting::Disabled => false,
                FeatureSetting::Auto => auto_rule(name, conditions),
            };
            (name, enabled)
        })
        .collect()
}

/// Rule table for `Auto` flags. CPU and memory buckets are load levels.
pub fn auto_rule(name: FeatureName, c: &CategorizedConditions) -> bool {
    match name {
        FeatureName::SpatialAudio => c.cpu != Bucket::High && c.device_tier != DeviceTier::Low,
        FeatureName::Reverb => c.cpu == Bucket::Low && c.memory != Bucket::High,
        FeatureName::Equalizer => c.memory != Bucket::High,
        FeatureName::NoiseSuppression => c.cpu != Bucket::High,
        FeatureName::DynamicCompression => {
            c.device_tier != DeviceTier::Low || c.cpu == Bucket::Low
        }
    }
}
