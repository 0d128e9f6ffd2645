//! Quality tiers and feature gating.

pub mod catalog;
pub mod features;

pub use catalog::{FeatureName, FeatureSetting, QualityLevel, QualityProfile};
