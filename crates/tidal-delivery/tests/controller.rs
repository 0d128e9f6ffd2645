//! End-to-end controller behaviour with mock collaborators and a mock clock.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quanta::Clock;

use tidal_delivery::adaptation::{AdaptationMode, Algorithm, UserBias};
use tidal_delivery::config::DeliveryConfig;
use tidal_delivery::error::{PipelineError, SettingsError, TransferError};
use tidal_delivery::metrics::render_prometheus;
use tidal_delivery::quality::{FeatureName, QualityLevel};
use tidal_delivery::settings::{self, MemorySettingsStore, SettingsStore};
use tidal_delivery::telemetry::monitor::TelemetryMonitor;
use tidal_delivery::telemetry::system::FixedProbe;
use tidal_delivery::telemetry::{DeviceTier, NetworkClass, ProbeReading, TelemetrySnapshot};
use tidal_delivery::transfer::{Priority, TransferId, TransferRequest};
use tidal_delivery::{AdaptiveDeliveryController, AppliedProfile, DeliveryEvent, QualityPipeline};

// ─── Fixtures ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct RecordingPipeline {
    applied: Arc<Mutex<Vec<AppliedProfile>>>,
    fail: Arc<Mutex<bool>>,
}

impl QualityPipeline for RecordingPipeline {
    fn apply(&mut self, profile: &AppliedProfile) -> Result<(), PipelineError> {
        if *self.fail.lock().unwrap() {
            return Err(PipelineError {
                profile: profile.profile.id().to_string(),
                message: "decoder busy".into(),
            });
        }
        self.applied.lock().unwrap().push(profile.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedStore(Arc<Mutex<MemorySettingsStore>>);

impl SettingsStore for SharedStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.0.lock().unwrap().set(key, value)
    }
}

struct Harness {
    controller: AdaptiveDeliveryController,
    pipeline: RecordingPipeline,
    store: SharedStore,
    mock: Arc<quanta::Mock>,
}

fn harness_with(store: SharedStore) -> Harness {
    let (clock, mock) = Clock::mock();
    let config = DeliveryConfig::default();
    let probe = Arc::new(FixedProbe::new(ProbeReading::default()));
    let monitor = TelemetryMonitor::new(probe, config.telemetry.clone()).unwrap();
    let pipeline = RecordingPipeline::default();
    let controller = AdaptiveDeliveryController::with_clock(
        config,
        monitor,
        Box::new(pipeline.clone()),
        Box::new(store.clone()),
        clock,
    );
    Harness {
        controller,
        pipeline,
        store,
        mock,
    }
}

fn harness() -> Harness {
    harness_with(SharedStore::default())
}

fn constrained() -> TelemetrySnapshot {
    TelemetrySnapshot {
        bandwidth_kbps: 200.0,
        measured_kbps: 200.0,
        network_class: NetworkClass::Cellular3g,
        cpu_load_pct: 90.0,
        memory_usage_pct: 80.0,
        battery_pct: 20.0,
        ..TelemetrySnapshot::neutral()
    }
}

fn ideal() -> TelemetrySnapshot {
    TelemetrySnapshot {
        bandwidth_kbps: 3_000.0,
        measured_kbps: 3_000.0,
        network_class: NetworkClass::Wifi,
        cpu_load_pct: 10.0,
        memory_usage_pct: 20.0,
        battery_pct: 95.0,
        device_tier: DeviceTier::High,
        ..TelemetrySnapshot::neutral()
    }
}

fn with_bandwidth(kbps: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        measured_kbps: kbps,
        ..ideal()
    }
}

// ─── Adaptation ─────────────────────────────────────────────────────────

#[test]
fn constrained_conditions_step_down_to_low() {
    let mut h = harness();
    let events = h.controller.on_telemetry(constrained());

    assert!(matches!(events[0], DeliveryEvent::StrategyChanged(s) if s.name == "cellular-3g"));
    match &events[1] {
        DeliveryEvent::QualityChanged { from, to, reason } => {
            assert_eq!(*from, QualityLevel::Medium);
            assert_eq!(*to, QualityLevel::Low);
            assert!(reason.contains("low bandwidth"), "reason: {reason}");
            assert!(reason.contains("battery conservation"), "reason: {reason}");
        }
        other => panic!("expected QualityChanged, got {other:?}"),
    }
    assert_eq!(h.controller.current_level(), QualityLevel::Low);

    let applied = h.pipeline.applied.lock().unwrap();
    let last = applied.last().unwrap();
    assert_eq!(last.profile.level, QualityLevel::Low);
    assert_eq!(last.profile.bitrate_kbps, 64);
    assert!(!last.features[&FeatureName::SpatialAudio]);
}

#[test]
fn ideal_conditions_reach_ultra_with_bitrate_capped_by_strategy() {
    let mut h = harness();
    h.controller.on_telemetry(ideal());
    assert_eq!(h.controller.current_level(), QualityLevel::Ultra);
    assert_eq!(h.controller.current_strategy().name, "broadband");
    let profile = h.controller.applied_profile().unwrap();
    assert_eq!(profile.profile.bitrate_kbps, 320);

    // Data saver caps the bitrate without changing the tier.
    let events = h.controller.on_telemetry(TelemetrySnapshot {
        data_saver: true,
        ..ideal()
    });
    assert!(matches!(events[0], DeliveryEvent::StrategyChanged(s) if s.name == "data-saver"));
    assert_eq!(h.controller.current_level(), QualityLevel::Ultra);
    assert_eq!(h.controller.applied_profile().unwrap().profile.bitrate_kbps, 48);
}

#[test]
fn repeated_identical_telemetry_is_idempotent() {
    let mut h = harness();
    h.controller.on_telemetry(constrained());
    let history = h.controller.history().len();
    let applied = h.pipeline.applied.lock().unwrap().len();

    let events = h.controller.on_telemetry(constrained());
    assert!(events.is_empty());
    assert_eq!(h.controller.history().len(), history);
    assert_eq!(h.pipeline.applied.lock().unwrap().len(), applied);
}

#[test]
fn pipeline_failure_rolls_back_and_notifies() {
    let mut h = harness();
    *h.pipeline.fail.lock().unwrap() = true;
    let events = h.controller.on_telemetry(constrained());

    assert!(events.iter().any(|e| matches!(
        e,
        DeliveryEvent::QualityChangeFailed { attempted: QualityLevel::Low, .. }
    )));
    assert_eq!(h.controller.current_level(), QualityLevel::Medium);
    assert!(h.controller.history().is_empty());
}

#[test]
fn rejected_strategy_refresh_keeps_last_accepted_profile() {
    let mut h = harness();
    h.controller.on_telemetry(ideal());
    assert_eq!(h.controller.applied_profile().unwrap().profile.bitrate_kbps, 320);

    *h.pipeline.fail.lock().unwrap() = true;
    let events = h.controller.on_telemetry(TelemetrySnapshot {
        data_saver: true,
        ..ideal()
    });
    assert!(matches!(events[0], DeliveryEvent::StrategyChanged(s) if s.name == "data-saver"));
    assert!(events.iter().any(|e| matches!(
        e,
        DeliveryEvent::ProfileRefreshFailed {
            level: QualityLevel::Ultra,
            strategy: "data-saver",
            ..
        }
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, DeliveryEvent::QualityChangeFailed { .. })));
    assert_eq!(h.controller.current_level(), QualityLevel::Ultra);
    assert_eq!(h.controller.applied_profile().unwrap().profile.bitrate_kbps, 320);
}

#[test]
fn rejected_manual_selection_leaves_adaptation_automatic() {
    let mut h = harness();
    *h.pipeline.fail.lock().unwrap() = true;
    let events = h.controller.set_level(QualityLevel::Ultra);
    assert!(matches!(
        events[0],
        DeliveryEvent::QualityChangeFailed { attempted: QualityLevel::Ultra, .. }
    ));
    assert!(!h.controller.stats().manual_override);
    assert_eq!(h.controller.current_level(), QualityLevel::Medium);

    *h.pipeline.fail.lock().unwrap() = false;
    h.controller.on_telemetry(constrained());
    assert_eq!(h.controller.current_level(), QualityLevel::Low);
}

#[test]
fn manual_selection_pins_the_tier_until_released() {
    let mut h = harness();
    let events = h.controller.set_level(QualityLevel::Ultra);
    assert!(matches!(
        events[0],
        DeliveryEvent::QualityChanged { to: QualityLevel::Ultra, .. }
    ));

    h.controller.on_telemetry(constrained());
    assert_eq!(h.controller.current_level(), QualityLevel::Ultra);
    let rec = h.controller.engine().last_recommendation().unwrap();
    assert_eq!(rec.level, QualityLevel::Low);

    h.controller.set_manual_override(false);
    h.controller.evaluate();
    assert_eq!(h.controller.current_level(), QualityLevel::Low);
}

#[test]
fn manual_mode_suppresses_automatic_transitions() {
    let mut h = harness();
    h.controller.set_mode(AdaptationMode::Manual);
    h.controller.on_telemetry(constrained());
    assert_eq!(h.controller.current_level(), QualityLevel::Medium);

    h.controller.set_mode(AdaptationMode::Automatic);
    h.controller.evaluate();
    assert_eq!(h.controller.current_level(), QualityLevel::Low);
}

#[test]
fn history_records_timestamps_from_the_clock() {
    let mut h = harness();
    h.controller.on_telemetry(constrained());
    h.mock.increment(std::time::Duration::from_secs(5));
    h.controller.on_telemetry(ideal());

    let history = h.controller.history();
    assert_eq!(history.len(), 2);
    assert!(history[1].at > history[0].at);
    assert_eq!(history[1].from, QualityLevel::Low);
    assert_eq!(history[1].to, QualityLevel::Ultra);
}

// ─── Settings ───────────────────────────────────────────────────────────

#[test]
fn user_changes_are_persisted() {
    let mut h = harness();
    h.controller.set_algorithm(Algorithm::Conservative);
    h.controller.set_user_bias(UserBias::Quality);
    h.controller.set_mode(AdaptationMode::Manual);
    h.controller.set_level(QualityLevel::High);

    let store = h.store.clone();
    assert_eq!(store.get(settings::KEY_ALGORITHM).as_deref(), Some("conservative"));
    assert_eq!(store.get(settings::KEY_USER_BIAS).as_deref(), Some("quality"));
    assert_eq!(store.get(settings::KEY_MODE).as_deref(), Some("manual"));
    assert_eq!(store.get(settings::KEY_LEVEL).as_deref(), Some("high"));
}

#[test]
fn persisted_settings_are_restored_on_construction() {
    let mut store = SharedStore::default();
    store.set(settings::KEY_ALGORITHM, "aggressive").unwrap();
    store.set(settings::KEY_MODE, "manual").unwrap();
    store.set(settings::KEY_LEVEL, "ultra").unwrap();
    store.set(settings::KEY_USER_BIAS, "bogus").unwrap();

    let h = harness_with(store);
    let engine = h.controller.engine();
    assert_eq!(engine.algorithm(), Algorithm::Aggressive);
    assert_eq!(engine.mode(), AdaptationMode::Manual);
    assert_eq!(engine.user_bias(), UserBias::Efficiency);
    assert_eq!(h.controller.current_level(), QualityLevel::Ultra);
}

// ─── Transfers & cache ──────────────────────────────────────────────────

#[test]
fn admission_respects_the_reserved_budget() {
    let mut h = harness();
    h.controller.on_telemetry(with_bandwidth(1_000.0));
    for id in 0..3 {
        h.controller
            .add_request(TransferRequest::new(id, format!("k{id}"), 1_000, 300.0));
    }
    let pass = h.controller.run_scheduler_pass();
    assert!((pass.budget_kbps - 800.0).abs() < 1e-6);
    assert_eq!(pass.admitted.len(), 2);
    assert_eq!(h.controller.scheduler().queue_len(), 1);
    assert!((h.controller.scheduler().committed_kbps() - 600.0).abs() < 1e-6);

    h.controller
        .on_transfer_completed(TransferId(0), Bytes::from_static(b"abc"));
    let pass = h.controller.run_scheduler_pass();
    assert_eq!(pass.admitted.len(), 1);
    assert_eq!(pass.admitted[0].id, TransferId(2));
}

#[test]
fn completed_transfer_is_cached_and_serves_later_requests() {
    let mut h = harness();
    h.controller.on_telemetry(with_bandwidth(1_000.0));
    h.controller
        .add_request(TransferRequest::new(1, "seg-1", 3, 100.0).with_priority(Priority::Important));
    let pass = h.controller.run_scheduler_pass();
    assert_eq!(pass.admitted.len(), 1);
    assert!(h.controller.cache().is_pinned("seg-1"));

    let events = h
        .controller
        .on_transfer_completed(TransferId(1), Bytes::from_static(b"xyz"));
    assert!(matches!(
        &events[0],
        DeliveryEvent::TransferCompleted { from_cache: false, .. }
    ));
    assert!(!h.controller.cache().is_pinned("seg-1"));
    assert_eq!(
        h.controller.cache().entry("seg-1").unwrap().priority,
        Priority::Important
    );

    let events = h
        .controller
        .add_request(TransferRequest::new(2, "seg-1", 3, 100.0));
    match &events[0] {
        DeliveryEvent::TransferCompleted {
            id,
            payload,
            from_cache,
            ..
        } => {
            assert_eq!(*id, TransferId(2));
            assert_eq!(payload.as_ref(), b"xyz");
            assert!(*from_cache);
        }
        other => panic!("expected cache hit, got {other:?}"),
    }
    assert_eq!(h.controller.scheduler().queue_len(), 0);
}

#[test]
fn failing_transfer_is_retried_then_dropped() {
    let mut h = harness();
    h.controller.on_telemetry(with_bandwidth(1_000.0));
    h.controller.add_request(
        TransferRequest::new(7, "flaky", 10, 50.0).with_priority(Priority::Essential),
    );

    let mut retries = Vec::new();
    let mut failed = None;
    for _ in 0..10 {
        let pass = h.controller.run_scheduler_pass();
        if pass.admitted.is_empty() {
            break;
        }
        for event in h
            .controller
            .on_transfer_failed(TransferId(7), TransferError::Timeout)
        {
            match event {
                DeliveryEvent::TransferRetrying { priority, .. } => retries.push(priority),
                DeliveryEvent::TransferFailed { retry_count, .. } => failed = Some(retry_count),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    assert_eq!(
        retries,
        vec![Priority::Important, Priority::Normal, Priority::Low]
    );
    assert_eq!(failed, Some(4));
    assert!(!h.controller.scheduler().contains(TransferId(7)));
    assert_eq!(h.controller.stats().transfers_failed, 1);
}

#[test]
fn cancelled_in_flight_transfer_is_not_retried() {
    let mut h = harness();
    h.controller.on_telemetry(with_bandwidth(1_000.0));
    h.controller
        .add_request(TransferRequest::new(3, "c", 10, 50.0));
    h.controller.run_scheduler_pass();

    h.controller.cancel(TransferId(3));
    let events = h
        .controller
        .on_transfer_failed(TransferId(3), TransferError::Cancelled);
    assert_eq!(events, vec![DeliveryEvent::TransferCancelled { id: TransferId(3) }]);
    assert_eq!(h.controller.scheduler().committed_kbps(), 0.0);
    assert!(!h.controller.cache().is_pinned("c"));
}

#[test]
fn stale_entries_expire_on_sweep() {
    let mut h = harness();
    h.controller.on_telemetry(with_bandwidth(1_000.0));
    h.controller
        .add_request(TransferRequest::new(1, "old", 3, 10.0));
    h.controller.run_scheduler_pass();
    h.controller
        .on_transfer_completed(TransferId(1), Bytes::from_static(b"old"));

    h.mock.increment(std::time::Duration::from_secs(3_601));
    assert_eq!(h.controller.sweep_cache(), vec!["old".to_string()]);
    assert!(h.controller.cache_get("old").is_none());
}

// ─── Statistics ─────────────────────────────────────────────────────────

#[test]
fn stats_render_as_prometheus_and_json() {
    let mut h = harness();
    h.controller.on_telemetry(constrained());
    let stats = h.controller.stats();
    assert_eq!(stats.level, QualityLevel::Low);
    assert_eq!(stats.strategy, "cellular-3g");
    assert_eq!(stats.transitions, 1);

    let text = render_prometheus(&stats);
    assert!(text.contains("tidal_quality_level{level=\"low\"} 1"));
    assert!(text.contains("tidal_strategy{name=\"cellular-3g\"} 1"));

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["level"], "low");
    assert_eq!(json["mode"], "automatic");
    assert_eq!(json["strategy"], "cellular-3g");
}
