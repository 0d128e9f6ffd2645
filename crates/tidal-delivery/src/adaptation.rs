//! # Quality Adaptation — Closed-Loop Control
//!
//! Turns telemetry snapshots into quality-tier transitions. Each evaluation
//! classifies bandwidth, CPU, memory and battery into ordinal buckets,
//! scores them and maps the score to a tier with one of three algorithms.
//!
//! ## Policy
//!
//! - **Conservative** follows the most restrictive dimension (minimum score).
//! - **Aggressive** uses a weighted sum, dominated by bandwidth.
//! - **Hybrid** interpolates between the two by the user's bias: toward
//!   aggressive when the user prioritizes quality, toward conservative
//!   otherwise.
//!
//! A transition applies the new profile through a caller-supplied closure
//! first; if that is rejected the previous tier is restored and no history
//! entry is written. Manual mode and the manual-override latch both keep
//! the recommendation visible but suppress automatic transitions.

use std::collections::VecDeque;
use std::fmt;

use quanta::{Clock, Instant};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AdaptationConfig, ClassificationThresholds, LevelThresholds};
use crate::error::PipelineError;
use crate::quality::QualityLevel;
use crate::telemetry::{DeviceTier, TelemetrySnapshot};

/// Ordinal classification of one telemetry dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Low,
    Medium,
    High,
}

impl Bucket {
    fn score(self) -> f64 {
        match self {
            Bucket::Low => 1.0,
            Bucket::Medium => 2.0,
            Bucket::High => 3.0,
        }
    }

    fn inverted_score(self) -> f64 {
        4.0 - self.score()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Conservative,
    Aggressive,
    #[default]
    Hybrid,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Conservative => "conservative",
            Algorithm::Aggressive => "aggressive",
            Algorithm::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conservative" => Some(Algorithm::Conservative),
            "aggressive" => Some(Algorithm::Aggressive),
            "hybrid" => Some(Algorithm::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdaptationMode {
    #[default]
    Automatic,
    Manual,
}

impl AdaptationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AdaptationMode::Automatic => "automatic",
            AdaptationMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(AdaptationMode::Automatic),
            "manual" => Some(AdaptationMode::Manual),
            _ => None,
        }
    }
}

/// Whether the user prioritizes quality or efficiency. Selects the hybrid
/// interpolation weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserBias {
    Quality,
    #[default]
    Efficiency,
}

impl UserBias {
    pub fn as_str(self) -> &'static str {
        match self {
            UserBias::Quality => "quality",
            UserBias::Efficiency => "efficiency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quality" => Some(UserBias::Quality),
            "efficiency" => Some(UserBias::Efficiency),
            _ => None,
        }
    }
}

/// Per-dimension buckets derived from one snapshot.
///
/// CPU and memory buckets are *load* levels (high = busy); bandwidth and
/// battery buckets are *headroom* levels (low = restrictive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizedConditions {
    pub bandwidth: Bucket,
    pub cpu: Bucket,
    pub memory: Bucket,
    pub battery: Bucket,
    pub device_tier: DeviceTier,
}

/// Numeric scores in [1, 3]; higher means more room for quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub bandwidth: f64,
    pub cpu: f64,
    pub memory: f64,
    pub battery: f64,
}

impl Scores {
    pub fn min(&self) -> f64 {
        self.bandwidth
            .min(self.cpu)
            .min(self.memory)
            .min(self.battery)
    }
}

impl CategorizedConditions {
    pub fn scores(&self) -> Scores {
        Scores {
            bandwidth: self.bandwidth.score(),
            cpu: self.cpu.inverted_score(),
            memory: self.memory.inverted_score(),
            battery: self.battery.score(),
        }
    }

    /// Human-readable cause of the current restriction.
    pub fn reason(&self) -> String {
        let scores = self.scores();
        let mut parts = Vec::new();
        if scores.bandwidth <= 1.0 {
            parts.push("low bandwidth");
        }
        if scores.cpu <= 1.0 {
            parts.push("high CPU");
        }
        if scores.memory <= 1.0 {
            parts.push("memory pressure");
        }
        if scores.battery <= 1.0 {
            parts.push("battery conservation");
        }
        if parts.is_empty() {
            "automatic optimization".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Bucket every dimension of `snapshot`.
pub fn classify(
    snapshot: &TelemetrySnapshot,
    thresholds: &ClassificationThresholds,
) -> CategorizedConditions {
    let bw = thresholds.bandwidth_kbps;
    let bandwidth = if snapshot.bandwidth_kbps < bw.low {
        Bucket::Low
    } else if snapshot.bandwidth_kbps < bw.high {
        Bucket::Medium
    } else {
        Bucket::High
    };

    let load = |value: f64, t: crate::config::BucketThresholds| {
        if value <= t.low {
            Bucket::Low
        } else if value <= t.high {
            Bucket::Medium
        } else {
            Bucket::High
        }
    };

    let bt = thresholds.battery_pct;
    let battery = if snapshot.battery_pct >= bt.high {
        Bucket::High
    } else if snapshot.battery_pct >= bt.low {
        Bucket::Medium
    } else {
        Bucket::Low
    };

    CategorizedConditions {
        bandwidth,
        cpu: load(snapshot.cpu_load_pct, thresholds.cpu_pct),
        memory: load(snapshot.memory_usage_pct, thresholds.memory_pct),
        battery,
        device_tier: snapshot.device_tier,
    }
}

/// Map a score to an ordinal tier.
pub fn score_to_level(score: f64, levels: &LevelThresholds) -> QualityLevel {
    if score <= levels.low_max {
        QualityLevel::Low
    } else if score <= levels.medium_max {
        QualityLevel::Medium
    } else if score <= levels.high_max {
        QualityLevel::High
    } else {
        QualityLevel::Ultra
    }
}

/// The three algorithm outputs for one set of conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidates {
    pub conservative: QualityLevel,
    pub aggressive: QualityLevel,
    pub hybrid: QualityLevel,
}

impl Candidates {
    pub fn select(&self, algorithm: Algorithm) -> QualityLevel {
        match algorithm {
            Algorithm::Conservative => self.conservative,
            Algorithm::Aggressive => self.aggressive,
            Algorithm::Hybrid => self.hybrid,
        }
    }
}

/// Interpolate between two ordinal tiers; `weight` pulls toward `toward`.
pub fn interpolate(from: QualityLevel, toward: QualityLevel, weight: f64) -> QualityLevel {
    let a = from.index().unwrap_or(1) as f64;
    let b = toward.index().unwrap_or(1) as f64;
    let w = weight.clamp(0.0, 1.0);
    let idx = (a * (1.0 - w) + b * w).round().max(0.0) as usize;
    QualityLevel::from_index(idx)
}

pub fn candidates(
    conditions: &CategorizedConditions,
    config: &AdaptationConfig,
    bias: UserBias,
) -> Candidates {
    let s = conditions.scores();
    let conservative = score_to_level(s.min(), &config.levels);

    let w = &config.weights;
    let weighted =
        w.bandwidth * s.bandwidth + w.cpu * s.cpu + w.memory * s.memory + w.battery * s.battery;
    let aggressive = score_to_level(weighted, &config.levels);

    let bias_weight = match bias {
        UserBias::Quality => config.quality_bias_weight,
        UserBias::Efficiency => config.efficiency_bias_weight,
    };
    let hybrid = interpolate(conservative, aggressive, bias_weight);

    Candidates {
        conservative,
        aggressive,
        hybrid,
    }
}

/// Audit record of one applied tier change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: QualityLevel,
    pub to: QualityLevel,
    /// `None` for manual selections made before any telemetry arrived.
    pub conditions: Option<CategorizedConditions>,
    pub reason: String,
    pub at: Instant,
}

/// Latest evaluation result, kept even when the transition is suppressed.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub level: QualityLevel,
    pub candidates: Candidates,
    pub conditions: CategorizedConditions,
    pub reason: String,
}

/// Why an evaluation did not transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Unchanged,
    ManualMode,
    ManualOverride,
}

impl fmt::Display for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hold::Unchanged => f.write_str("unchanged"),
            Hold::ManualMode => f.write_str("manual mode"),
            Hold::ManualOverride => f.write_str("manual override"),
        }
    }
}

/// Outcome of a single evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Transitioned(Transition),
    Held(Hold),
    Rejected {
        attempted: QualityLevel,
        error: PipelineError,
    },
}

/// Single-writer adaptation state machine.
pub struct AdaptationEngine {
    config: AdaptationConfig,
    clock: Clock,
    current_level: QualityLevel,
    mode: AdaptationMode,
    algorithm: Algorithm,
    user_bias: UserBias,
    manual_override: bool,
    history: VecDeque<Transition>,
    last_recommendation: Option<Recommendation>,
    last_conditions: Option<CategorizedConditions>,
}

impl AdaptationEngine {
    pub fn new(config: AdaptationConfig, clock: Clock) -> Self {
        AdaptationEngine {
            mode: config.mode,
            algorithm: config.algorithm,
            user_bias: config.user_bias,
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            clock,
            current_level: QualityLevel::Medium,
            manual_override: false,
            last_recommendation: None,
            last_conditions: None,
        }
    }

    /// Start from a previously persisted tier.
    pub fn with_level(mut self, level: QualityLevel) -> Self {
        self.current_level = level;
        self
    }

    pub fn current_level(&self) -> QualityLevel {
        self.current_level
    }

    pub fn mode(&self) -> AdaptationMode {
        self.mode
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn user_bias(&self) -> UserBias {
        self.user_bias
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// Applied transitions, oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn last_recommendation(&self) -> Option<&Recommendation> {
        self.last_recommendation.as_ref()
    }

    pub fn last_conditions(&self) -> Option<&CategorizedConditions> {
        self.last_conditions.as_ref()
    }

    pub fn set_mode(&mut self, mode: AdaptationMode) {
        self.mode = mode;
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.algorithm = algorithm;
    }

    pub fn set_user_bias(&mut self, bias: UserBias) {
        self.user_bias = bias;
    }

    pub fn set_manual_override(&mut self, enabled: bool) {
        self.manual_override = enabled;
    }

    /// Classify and score without changing the current tier.
    pub fn recommend(&mut self, snapshot: &TelemetrySnapshot) -> Recommendation {
        let conditions = classify(snapshot, &self.config.thresholds);
        let candidates = candidates(&conditions, &self.config, self.user_bias);
        let rec = Recommendation {
            level: candidates.select(self.algorithm),
            candidates,
            conditions,
            reason: conditions.reason(),
        };
        self.last_conditions = Some(conditions);
        self.last_recommendation = Some(rec.clone());
        rec
    }

    /// One evaluation step. `apply` pushes the chosen tier to the pipeline;
    /// an error rolls the tier back and records nothing.
    pub fn evaluate<F>(&mut self, snapshot: &TelemetrySnapshot, apply: F) -> Evaluation
    where
        F: FnOnce(QualityLevel, &CategorizedConditions) -> Result<(), PipelineError>,
    {
        let rec = self.recommend(snapshot);

        if self.manual_override {
            debug!(recommended = %rec.level, "transition suppressed by manual override");
            return Evaluation::Held(Hold::ManualOverride);
        }
        if self.mode == AdaptationMode::Manual {
            debug!(recommended = %rec.level, "transition suppressed in manual mode");
            return Evaluation::Held(Hold::ManualMode);
        }
        if rec.level == self.current_level {
            return Evaluation::Held(Hold::Unchanged);
        }

        self.transition(rec.level, Some(rec.conditions), rec.reason, apply)
    }

    /// Force a tier. Latches the manual override so telemetry cannot undo it.
    /// A rejected apply leaves both the tier and the latch as they were.
    pub fn set_level<F>(&mut self, level: QualityLevel, apply: F) -> Evaluation
    where
        F: FnOnce(QualityLevel, &CategorizedConditions) -> Result<(), PipelineError>,
    {
        if level == self.current_level {
            self.manual_override = true;
            return Evaluation::Held(Hold::Unchanged);
        }
        let conditions = self.last_conditions;
        let result = self.transition(level, conditions, "manual selection".to_string(), apply);
        if matches!(result, Evaluation::Transitioned(_)) {
            self.manual_override = true;
        }
        result
    }

    fn transition<F>(
        &mut self,
        to: QualityLevel,
        conditions: Option<CategorizedConditions>,
        reason: String,
        apply: F,
    ) -> Evaluation
    where
        F: FnOnce(QualityLevel, &CategorizedConditions) -> Result<(), PipelineError>,
    {
        let from = self.current_level;
        self.current_level = to;
        let apply_conditions = conditions.unwrap_or(NEUTRAL_CONDITIONS);

        if let Err(error) = apply(to, &apply_conditions) {
            self.current_level = from;
            warn!(%from, attempted = %to, %error, "quality change rejected, rolled back");
            return Evaluation::Rejected {
                attempted: to,
                error,
            };
        }

        let transition = Transition {
            from,
            to,
            conditions,
            reason,
            at: self.clock.now(),
        };
        info!(%from, %to, reason = %transition.reason, "quality level changed");

        while self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        Evaluation::Transitioned(transition)
    }
}

/// Conditions used when a tier must be applied before any telemetry.
pub const NEUTRAL_CONDITIONS: CategorizedConditions = CategorizedConditions {
    bandwidth: Bucket::Medium,
    cpu: Bucket::Medium,
    memory: Bucket::Medium,
    battery: Bucket::Medium,
    device_tier: DeviceTier::Mid,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bw: f64, cpu: f64, mem: f64, battery: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            bandwidth_kbps: bw,
            measured_kbps: bw,
            cpu_load_pct: cpu,
            memory_usage_pct: mem,
            battery_pct: battery,
            ..TelemetrySnapshot::neutral()
        }
    }

    fn engine(algorithm: Algorithm) -> AdaptationEngine {
        let (clock, _mock) = Clock::mock();
        AdaptationEngine::new(
            AdaptationConfig {
                algorithm,
                ..Default::default()
            },
            clock,
        )
    }

    fn ok(_: QualityLevel, _: &CategorizedConditions) -> Result<(), PipelineError> {
        Ok(())
    }

    // ─── Classification ─────────────────────────────────────────────────

    #[test]
    fn default_bucket_edges() {
        let t = ClassificationThresholds::default();
        let c = classify(&snapshot(499.0, 30.0, 40.0, 80.0), &t);
        assert_eq!(c.bandwidth, Bucket::Low);
        assert_eq!(c.cpu, Bucket::Low);
        assert_eq!(c.memory, Bucket::Low);
        assert_eq!(c.battery, Bucket::High);

        let c = classify(&snapshot(500.0, 60.0, 70.0, 50.0), &t);
        assert_eq!(c.bandwidth, Bucket::Medium);
        assert_eq!(c.cpu, Bucket::Medium);
        assert_eq!(c.memory, Bucket::Medium);
        assert_eq!(c.battery, Bucket::Medium);

        let c = classify(&snapshot(1_500.0, 60.1, 70.1, 49.9), &t);
        assert_eq!(c.bandwidth, Bucket::High);
        assert_eq!(c.cpu, Bucket::High);
        assert_eq!(c.memory, Bucket::High);
        assert_eq!(c.battery, Bucket::Low);
    }

    #[test]
    fn score_thresholds() {
        let l = LevelThresholds::default();
        assert_eq!(score_to_level(1.0, &l), QualityLevel::Low);
        assert_eq!(score_to_level(1.3, &l), QualityLevel::Low);
        assert_eq!(score_to_level(2.0, &l), QualityLevel::Medium);
        assert_eq!(score_to_level(2.7, &l), QualityLevel::High);
        assert_eq!(score_to_level(2.71, &l), QualityLevel::Ultra);
    }

    // ─── Algorithms ─────────────────────────────────────────────────────

    #[test]
    fn conservative_follows_low_bandwidth() {
        let mut e = engine(Algorithm::Conservative);
        let result = e.evaluate(&snapshot(300.0, 20.0, 30.0, 90.0), ok);
        let Evaluation::Transitioned(t) = result else {
            panic!("expected transition, got {result:?}");
        };
        assert_eq!(t.from, QualityLevel::Medium);
        assert_eq!(t.to, QualityLevel::Low);
        assert!(t.reason.contains("bandwidth"), "reason: {}", t.reason);
        assert_eq!(e.current_level(), QualityLevel::Low);
        assert_eq!(e.history().len(), 1);
    }

    #[test]
    fn aggressive_uses_weighted_sum() {
        let c = classify(
            &snapshot(300.0, 20.0, 30.0, 90.0),
            &ClassificationThresholds::default(),
        );
        // 0.4·1 + 0.3·3 + 0.2·3 + 0.1·3 = 2.2 → high
        let cands = candidates(&c, &AdaptationConfig::default(), UserBias::Efficiency);
        assert_eq!(cands.conservative, QualityLevel::Low);
        assert_eq!(cands.aggressive, QualityLevel::High);
    }

    #[test]
    fn hybrid_interpolates_by_bias() {
        assert_eq!(
            interpolate(QualityLevel::Low, QualityLevel::Ultra, 0.7),
            QualityLevel::High
        );
        assert_eq!(
            interpolate(QualityLevel::Low, QualityLevel::Ultra, 0.3),
            QualityLevel::Medium
        );
        assert_eq!(
            interpolate(QualityLevel::Medium, QualityLevel::Medium, 0.7),
            QualityLevel::Medium
        );
    }

    #[test]
    fn hybrid_candidate_respects_user_bias() {
        let c = CategorizedConditions {
            bandwidth: Bucket::Low,
            cpu: Bucket::Low,
            memory: Bucket::Low,
            battery: Bucket::High,
            device_tier: DeviceTier::Mid,
        };
        let config = AdaptationConfig {
            // bandwidth-free weighting so aggressive lands on ultra
            weights: crate::config::AggressiveWeights {
                bandwidth: 0.0,
                cpu: 0.4,
                memory: 0.4,
                battery: 0.2,
            },
            ..Default::default()
        };
        let q = candidates(&c, &config, UserBias::Quality);
        assert_eq!(q.conservative, QualityLevel::Low);
        assert_eq!(q.aggressive, QualityLevel::Ultra);
        assert_eq!(q.hybrid, QualityLevel::High);

        let e = candidates(&c, &config, UserBias::Efficiency);
        assert_eq!(e.hybrid, QualityLevel::Medium);
    }

    #[test]
    fn reason_names_every_restrictive_dimension() {
        let c = classify(
            &snapshot(2_000.0, 90.0, 30.0, 10.0),
            &ClassificationThresholds::default(),
        );
        let reason = c.reason();
        assert!(reason.contains("high CPU"));
        assert!(reason.contains("battery conservation"));
        assert!(!reason.contains("bandwidth"));

        let calm = classify(
            &snapshot(1_000.0, 45.0, 55.0, 65.0),
            &ClassificationThresholds::default(),
        );
        assert_eq!(calm.reason(), "automatic optimization");
    }

    // ─── State machine ──────────────────────────────────────────────────

    #[test]
    fn rejected_apply_rolls_back() {
        let mut e = engine(Algorithm::Conservative);
        let result = e.evaluate(&snapshot(300.0, 20.0, 30.0, 90.0), |level, _| {
            Err(PipelineError {
                profile: level.to_string(),
                message: "decoder busy".into(),
            })
        });
        assert!(matches!(
            result,
            Evaluation::Rejected {
                attempted: QualityLevel::Low,
                ..
            }
        ));
        assert_eq!(e.current_level(), QualityLevel::Medium);
        assert_eq!(e.history().len(), 0);
    }

    #[test]
    fn rejected_set_level_keeps_automatic_control() {
        let mut e = engine(Algorithm::Conservative);
        let result = e.set_level(QualityLevel::Ultra, |level, _| {
            Err(PipelineError {
                profile: level.to_string(),
                message: "decoder busy".into(),
            })
        });
        assert!(matches!(
            result,
            Evaluation::Rejected {
                attempted: QualityLevel::Ultra,
                ..
            }
        ));
        assert!(!e.manual_override());
        assert_eq!(e.current_level(), QualityLevel::Medium);
        assert!(e.history().len() == 0);

        let r = e.evaluate(&snapshot(100.0, 20.0, 30.0, 90.0), ok);
        assert!(matches!(r, Evaluation::Transitioned(_)), "got {r:?}");
        assert_eq!(e.current_level(), QualityLevel::Low);
    }

    #[test]
    fn rejected_set_level_keeps_existing_override() {
        let mut e = engine(Algorithm::Conservative);
        e.set_level(QualityLevel::High, ok);
        e.set_level(QualityLevel::Ultra, |level, _| {
            Err(PipelineError {
                profile: level.to_string(),
                message: "decoder busy".into(),
            })
        });
        assert!(e.manual_override());
        assert_eq!(e.current_level(), QualityLevel::High);
    }

    #[test]
    fn unchanged_level_is_held() {
        let mut e = engine(Algorithm::Conservative).with_level(QualityLevel::Low);
        let result = e.evaluate(&snapshot(300.0, 20.0, 30.0, 90.0), ok);
        assert_eq!(result, Evaluation::Held(Hold::Unchanged));
    }

    #[test]
    fn manual_mode_suppresses_but_recommends() {
        let mut e = engine(Algorithm::Conservative);
        e.set_mode(AdaptationMode::Manual);
        let result = e.evaluate(&snapshot(300.0, 20.0, 30.0, 90.0), ok);
        assert_eq!(result, Evaluation::Held(Hold::ManualMode));
        assert_eq!(e.current_level(), QualityLevel::Medium);
        assert_eq!(e.last_recommendation().unwrap().level, QualityLevel::Low);
    }

    #[test]
    fn set_level_latches_override() {
        let mut e = engine(Algorithm::Conservative);
        let result = e.set_level(QualityLevel::Ultra, ok);
        assert!(matches!(result, Evaluation::Transitioned(_)));
        assert!(e.manual_override());
        assert_eq!(e.mode(), AdaptationMode::Automatic);

        for bw in [100.0, 300.0, 5_000.0] {
            let r = e.evaluate(&snapshot(bw, 95.0, 95.0, 5.0), ok);
            assert_eq!(r, Evaluation::Held(Hold::ManualOverride));
            assert_eq!(e.current_level(), QualityLevel::Ultra);
        }

        e.set_manual_override(false);
        e.evaluate(&snapshot(100.0, 95.0, 95.0, 5.0), ok);
        assert_eq!(e.current_level(), QualityLevel::Low);
    }

    #[test]
    fn history_is_capped() {
        let (clock, _mock) = Clock::mock();
        let mut e = AdaptationEngine::new(
            AdaptationConfig {
                algorithm: Algorithm::Conservative,
                history_capacity: 3,
                ..Default::default()
            },
            clock,
        );
        for i in 0..10 {
            let bw = if i % 2 == 0 { 100.0 } else { 1_000.0 };
            e.evaluate(&snapshot(bw, 45.0, 55.0, 65.0), ok);
        }
        assert_eq!(e.history().len(), 3);
        let last = e.history().last().unwrap();
        assert_eq!(last.to, QualityLevel::Medium);
    }
}
