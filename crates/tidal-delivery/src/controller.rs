//! # Adaptive Delivery Controller
//!
//! Owns the telemetry monitor, adaptation engine, strategy selector,
//! transfer scheduler and content cache. Every method takes `&mut self`:
//! the controller is the single writer of all decision state and is meant
//! to be driven from one worker (see [`crate::runtime`]).
//!
//! Methods that change observable state return the [`DeliveryEvent`]s they
//! produced instead of calling out, so the caller decides how to fan them
//! out.

use std::collections::BTreeMap;

use bytes::Bytes;
use quanta::Clock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::adaptation::{
    self, AdaptationEngine, AdaptationMode, Algorithm, CategorizedConditions, Evaluation,
    Transition, UserBias, NEUTRAL_CONDITIONS,
};
use crate::config::DeliveryConfig;
use crate::error::{PipelineError, TransferError};
use crate::quality::catalog::{self, adaptive_profile};
use crate::quality::features;
use crate::quality::{FeatureName, QualityLevel, QualityProfile};
use crate::settings::{self, PersistedSettings, SettingsStore};
use crate::strategy::{Strategy, StrategySelector};
use crate::telemetry::monitor::TelemetryMonitor;
use crate::telemetry::TelemetrySnapshot;
use crate::transfer::cache::{CacheStats, ContentCache};
use crate::transfer::scheduler::{
    AdmissionPass, CancelOutcome, FailureOutcome, SchedulerStats, TransferScheduler,
};
use crate::transfer::{Priority, TransferId, TransferRequest};

/// Profile handed to the pipeline: catalog parameters with the bitrate
/// capped by the active strategy and every feature resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedProfile {
    pub profile: QualityProfile,
    pub features: BTreeMap<FeatureName, bool>,
    pub strategy: &'static str,
}

/// Audio/content pipeline collaborator.
pub trait QualityPipeline: Send {
    fn apply(&mut self, profile: &AppliedProfile) -> Result<(), PipelineError>;
}

/// Outbound notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    QualityChanged {
        from: QualityLevel,
        to: QualityLevel,
        reason: String,
    },
    QualityChangeFailed {
        attempted: QualityLevel,
        error: PipelineError,
    },
    StrategyChanged(Strategy),
    /// The pipeline refused the current tier under a new strategy ceiling.
    /// The tier is unchanged and the pipeline keeps its last accepted profile.
    ProfileRefreshFailed {
        level: QualityLevel,
        strategy: &'static str,
        error: PipelineError,
    },
    TransferCompleted {
        id: TransferId,
        key: String,
        payload: Bytes,
        from_cache: bool,
    },
    TransferRetrying {
        id: TransferId,
        retry_count: u32,
        priority: Priority,
    },
    TransferFailed {
        id: TransferId,
        key: String,
        retry_count: u32,
        error: TransferError,
    },
    TransferCancelled {
        id: TransferId,
    },
}

/// Point-in-time view for display and metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub level: QualityLevel,
    pub mode: AdaptationMode,
    pub algorithm: Algorithm,
    pub user_bias: UserBias,
    pub manual_override: bool,
    pub strategy: &'static str,
    pub transitions: usize,
    pub bandwidth_kbps: f64,
    pub budget_kbps: f64,
    pub committed_kbps: f64,
    pub queued: usize,
    pub in_flight: usize,
    pub transfers_admitted: u64,
    pub transfers_completed: u64,
    pub transfers_retried: u64,
    pub transfers_failed: u64,
    pub transfers_cancelled: u64,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub cache_max_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_expirations: u64,
}

pub struct AdaptiveDeliveryController {
    config: DeliveryConfig,
    monitor: TelemetryMonitor,
    engine: AdaptationEngine,
    strategy: StrategySelector,
    scheduler: TransferScheduler,
    cache: ContentCache,
    pipeline: Box<dyn QualityPipeline>,
    settings: Box<dyn SettingsStore>,
    snapshot: Option<TelemetrySnapshot>,
    applied: Option<AppliedProfile>,
}

impl AdaptiveDeliveryController {
    pub fn new(
        config: DeliveryConfig,
        monitor: TelemetryMonitor,
        pipeline: Box<dyn QualityPipeline>,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        Self::with_clock(config, monitor, pipeline, settings, Clock::new())
    }

    /// Construct with an explicit clock (use `Clock::mock()` in tests).
    pub fn with_clock(
        config: DeliveryConfig,
        monitor: TelemetryMonitor,
        pipeline: Box<dyn QualityPipeline>,
        settings: Box<dyn SettingsStore>,
        clock: Clock,
    ) -> Self {
        let persisted = PersistedSettings::load(settings.as_ref());
        let mut engine = AdaptationEngine::new(config.adaptation.clone(), clock.clone());
        if let Some(algorithm) = persisted.algorithm {
            engine.set_algorithm(algorithm);
        }
        if let Some(mode) = persisted.mode {
            engine.set_mode(mode);
        }
        if let Some(bias) = persisted.user_bias {
            engine.set_user_bias(bias);
        }
        if let Some(level) = persisted.level {
            engine = engine.with_level(level);
        }
        debug!(?persisted, "controller restored settings");

        AdaptiveDeliveryController {
            strategy: StrategySelector::new(config.strategy.clone()),
            scheduler: TransferScheduler::new(config.scheduler.clone()),
            cache: ContentCache::new(config.cache.clone(), clock),
            config,
            monitor,
            engine,
            pipeline,
            settings,
            snapshot: None,
            applied: None,
        }
    }

    // ─── Telemetry & adaptation ─────────────────────────────────────────

    pub fn monitor(&self) -> &TelemetryMonitor {
        &self.monitor
    }

    /// Refresh telemetry from the monitor and react to it.
    pub fn poll_telemetry(&mut self) -> Vec<DeliveryEvent> {
        let snapshot = self.monitor.refresh();
        self.on_telemetry(snapshot)
    }

    /// React to a new snapshot: reselect the strategy, then evaluate quality.
    pub fn on_telemetry(&mut self, snapshot: TelemetrySnapshot) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        let strategy_changed = match self.strategy.update(&snapshot) {
            Some(strategy) => {
                events.push(DeliveryEvent::StrategyChanged(strategy));
                true
            }
            None => false,
        };
        self.snapshot = Some(snapshot);
        let transitioned = self.evaluate_into(&mut events);

        // A new bitrate ceiling must reach the pipeline even without a tier change.
        if !transitioned && (strategy_changed || self.applied.is_none()) {
            self.reapply_current(&mut events);
        }
        events
    }

    /// Evaluate against the latest snapshot without new telemetry.
    pub fn evaluate(&mut self) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        self.evaluate_into(&mut events);
        events
    }

    fn evaluate_into(&mut self, events: &mut Vec<DeliveryEvent>) -> bool {
        let snapshot = match &self.snapshot {
            Some(s) => s.clone(),
            None => self.monitor.sample(),
        };
        let strategy = self.strategy.current();
        let adaptive_base = self.adaptive_base(&snapshot);
        let pipeline = &mut self.pipeline;
        let mut applied = None;

        let result = self.engine.evaluate(&snapshot, |level, conditions| {
            let profile = build_profile(level, conditions, &strategy, adaptive_base);
            pipeline.apply(&profile)?;
            applied = Some(profile);
            Ok(())
        });
        let transitioned = matches!(result, Evaluation::Transitioned(_));
        if let Some(profile) = applied {
            self.applied = Some(profile);
        }
        self.record(result, events);
        transitioned
    }

    fn reapply_current(&mut self, events: &mut Vec<DeliveryEvent>) {
        let level = self.engine.current_level();
        let conditions = self
            .engine
            .last_conditions()
            .copied()
            .unwrap_or(NEUTRAL_CONDITIONS);
        let base = match &self.snapshot {
            Some(s) => self.adaptive_base(s),
            None => QualityLevel::Medium,
        };
        let strategy = self.strategy.current();
        let profile = build_profile(level, &conditions, &strategy, base);
        match self.pipeline.apply(&profile) {
            Ok(()) => self.applied = Some(profile),
            Err(error) => {
                warn!(
                    %level,
                    strategy = strategy.name,
                    %error,
                    "pipeline rejected profile refresh"
                );
                events.push(DeliveryEvent::ProfileRefreshFailed {
                    level,
                    strategy: strategy.name,
                    error,
                });
            }
        }
    }

    fn adaptive_base(&self, snapshot: &TelemetrySnapshot) -> QualityLevel {
        let conditions = adaptation::classify(snapshot, &self.config.adaptation.thresholds);
        adaptation::candidates(&conditions, self.engine.config(), self.engine.user_bias())
            .aggressive
    }

    fn record(&mut self, result: Evaluation, events: &mut Vec<DeliveryEvent>) {
        match result {
            Evaluation::Transitioned(t) => {
                self.persist(settings::KEY_LEVEL, t.to.as_str());
                events.push(DeliveryEvent::QualityChanged {
                    from: t.from,
                    to: t.to,
                    reason: t.reason,
                });
            }
            Evaluation::Rejected { attempted, error } => {
                events.push(DeliveryEvent::QualityChangeFailed { attempted, error });
            }
            Evaluation::Held(_) => {}
        }
    }

    // ─── Manual controls ────────────────────────────────────────────────

    /// Force a tier. Latches the manual override; does not change the mode.
    pub fn set_level(&mut self, level: QualityLevel) -> Vec<DeliveryEvent> {
        let strategy = self.strategy.current();
        let adaptive_base = match &self.snapshot {
            Some(s) => self.adaptive_base(s),
            None => QualityLevel::Medium,
        };
        let pipeline = &mut self.pipeline;
        let mut applied = None;
        let result = self.engine.set_level(level, |level, conditions| {
            let profile = build_profile(level, conditions, &strategy, adaptive_base);
            pipeline.apply(&profile)?;
            applied = Some(profile);
            Ok(())
        });
        if let Some(profile) = applied {
            self.applied = Some(profile);
        }
        let mut events = Vec::new();
        self.record(result, &mut events);
        events
    }

    pub fn set_mode(&mut self, mode: AdaptationMode) {
        self.engine.set_mode(mode);
        self.persist(settings::KEY_MODE, mode.as_str());
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.engine.set_algorithm(algorithm);
        self.persist(settings::KEY_ALGORITHM, algorithm.as_str());
    }

    pub fn set_user_bias(&mut self, bias: UserBias) {
        self.engine.set_user_bias(bias);
        self.persist(settings::KEY_USER_BIAS, bias.as_str());
    }

    pub fn set_manual_override(&mut self, enabled: bool) {
        self.engine.set_manual_override(enabled);
    }

    fn persist(&mut self, key: &str, value: &str) {
        if let Err(e) = self.settings.set(key, value) {
            warn!(key, value, error = %e, "failed to persist setting");
        }
    }

    // ─── Transfers ──────────────────────────────────────────────────────

    /// Serve from cache when possible, otherwise queue.
    pub fn add_request(&mut self, request: TransferRequest) -> Vec<DeliveryEvent> {
        if let Some(payload) = self.cache.get(&request.key) {
            debug!(id = %request.id, key = %request.key, "served from cache");
            return vec![DeliveryEvent::TransferCompleted {
                id: request.id,
                key: request.key,
                payload,
                from_cache: true,
            }];
        }
        self.scheduler.add_request(request);
        Vec::new()
    }

    pub fn prioritize(&mut self, id: TransferId, priority: Priority) -> bool {
        self.scheduler.prioritize(id, priority)
    }

    pub fn cancel(&mut self, id: TransferId) -> CancelOutcome {
        self.scheduler.cancel(id)
    }

    /// Admit what fits the current budget. Admitted keys are pinned in
    /// the cache until their transfer resolves.
    pub fn run_scheduler_pass(&mut self) -> AdmissionPass {
        let bandwidth = self.bandwidth_kbps();
        let pass = self.scheduler.pass(bandwidth, &self.strategy.current());
        for req in &pass.admitted {
            self.cache.pin(&req.key);
        }
        pass
    }

    pub fn on_transfer_completed(&mut self, id: TransferId, payload: Bytes) -> Vec<DeliveryEvent> {
        let Some(req) = self.scheduler.complete(id) else {
            return Vec::new();
        };
        self.cache.unpin(&req.key);
        if let Err(e) = self.cache.put(req.key.clone(), payload.clone(), req.priority) {
            warn!(id = %id, key = %req.key, error = %e, "completed transfer not cached");
        }
        vec![DeliveryEvent::TransferCompleted {
            id,
            key: req.key,
            payload,
            from_cache: false,
        }]
    }

    pub fn on_transfer_failed(
        &mut self,
        id: TransferId,
        error: TransferError,
    ) -> Vec<DeliveryEvent> {
        let Some(outcome) = self.scheduler.fail(id) else {
            return Vec::new();
        };
        let event = match outcome {
            FailureOutcome::Requeued(req) => {
                self.cache.unpin(&req.key);
                DeliveryEvent::TransferRetrying {
                    id,
                    retry_count: req.retry_count,
                    priority: req.priority,
                }
            }
            FailureOutcome::Dropped(req) => {
                self.cache.unpin(&req.key);
                DeliveryEvent::TransferFailed {
                    id,
                    key: req.key,
                    retry_count: req.retry_count,
                    error,
                }
            }
            FailureOutcome::Cancelled(req) => {
                self.cache.unpin(&req.key);
                DeliveryEvent::TransferCancelled { id }
            }
        };
        vec![event]
    }

    // ─── Cache ──────────────────────────────────────────────────────────

    pub fn cache_get(&mut self, key: &str) -> Option<Bytes> {
        self.cache.get(key)
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn sweep_cache(&mut self) -> Vec<String> {
        self.cache.sweep_expired()
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn current_level(&self) -> QualityLevel {
        self.engine.current_level()
    }

    /// Last profile the pipeline accepted. After a rejected refresh its
    /// bitrate may sit above the current strategy ceiling.
    pub fn applied_profile(&self) -> Option<&AppliedProfile> {
        self.applied.as_ref()
    }

    pub fn current_strategy(&self) -> Strategy {
        self.strategy.current()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.engine.history().cloned().collect()
    }

    pub fn engine(&self) -> &AdaptationEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &TransferScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn last_snapshot(&self) -> Option<&TelemetrySnapshot> {
        self.snapshot.as_ref()
    }

    fn bandwidth_kbps(&self) -> f64 {
        self.snapshot
            .as_ref()
            .map(|s| s.measured_kbps)
            .unwrap_or_else(|| self.monitor.sample().measured_kbps)
    }

    pub fn stats(&self) -> DeliveryStats {
        let bandwidth = self.bandwidth_kbps();
        let sched: SchedulerStats = self.scheduler.stats();
        let cache: CacheStats = self.cache.stats();
        DeliveryStats {
            level: self.engine.current_level(),
            mode: self.engine.mode(),
            algorithm: self.engine.algorithm(),
            user_bias: self.engine.user_bias(),
            manual_override: self.engine.manual_override(),
            strategy: self.strategy.current().name,
            transitions: self.engine.history().len(),
            bandwidth_kbps: bandwidth,
            budget_kbps: self.scheduler.available_budget(bandwidth),
            committed_kbps: self.scheduler.committed_kbps(),
            queued: self.scheduler.queue_len(),
            in_flight: self.scheduler.in_flight_len(),
            transfers_admitted: sched.admitted,
            transfers_completed: sched.completed,
            transfers_retried: sched.retried,
            transfers_failed: sched.failed,
            transfers_cancelled: sched.cancelled,
            cache_entries: cache.entries,
            cache_bytes: cache.total_bytes,
            cache_max_bytes: cache.max_size_bytes,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            cache_expirations: cache.expirations,
        }
    }
}

/// Catalog profile for `level` (adaptive built from `adaptive_base`), with
/// the bitrate capped by `strategy` and features resolved for `conditions`.
pub fn build_profile(
    level: QualityLevel,
    conditions: &CategorizedConditions,
    strategy: &Strategy,
    adaptive_base: QualityLevel,
) -> AppliedProfile {
    let mut profile = match catalog::profile(level) {
        Some(p) => *p,
        None => adaptive_profile(adaptive_base),
    };
    profile.bitrate_kbps = profile.bitrate_kbps.min(strategy.max_bitrate_kbps);
    let features = features::resolve(&profile, conditions);
    AppliedProfile {
        profile,
        features,
        strategy: strategy.name,
    }
}
