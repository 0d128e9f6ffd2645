//! # Telemetry Monitor
//!
//! Keeps the latest [`TelemetrySnapshot`] behind an `ArcSwap` so readers
//! never contend with the prober. Probing happens on a dedicated thread;
//! a refresh waits at most `probe_timeout` for it and otherwise keeps the
//! previous snapshot.
//!
//! Snapshots are published to subscribers on every periodic poll and on
//! every [`EnvironmentEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use quanta::Instant;
use tracing::{debug, warn};

use super::{EnvironmentEvent, ProbeReading, TelemetryProbe, TelemetrySnapshot};
use crate::config::TelemetryConfig;

/// Dedicated probing thread. Requests are tagged so that a late answer to
/// a timed-out request is never mistaken for the current one.
struct ProbeWorker {
    request_tx: Sender<u64>,
    response_rx: Receiver<(u64, ProbeReading)>,
    next_id: u64,
}

impl ProbeWorker {
    fn spawn(probe: Arc<dyn TelemetryProbe>) -> std::io::Result<Self> {
        let (request_tx, request_rx) = bounded::<u64>(1);
        let (response_tx, response_rx) = bounded(4);
        thread::Builder::new()
            .name("tidal-probe".into())
            .spawn(move || {
                while let Ok(id) = request_rx.recv() {
                    let reading = probe.read();
                    if response_tx.send((id, reading)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(ProbeWorker {
            request_tx,
            response_rx,
            next_id: 0,
        })
    }

    fn probe(&mut self, timeout: Duration) -> Option<ProbeReading> {
        self.next_id += 1;
        let id = self.next_id;
        match self.request_tx.try_send(id) {
            Ok(()) => {}
            // Previous probe still running.
            Err(TrySendError::Full(_)) => return None,
            Err(TrySendError::Disconnected(_)) => return None,
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok((resp_id, reading)) if resp_id == id => return Some(reading),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }
}

struct ProbeState {
    worker: ProbeWorker,
    smoothed_kbps: Option<f64>,
}

struct Shared {
    config: TelemetryConfig,
    latest: ArcSwap<TelemetrySnapshot>,
    probe: Mutex<ProbeState>,
    subscribers: Mutex<Vec<Sender<TelemetrySnapshot>>>,
    sequence: AtomicU64,
}

/// Observes host signals and hands out immutable snapshots.
#[derive(Clone)]
pub struct TelemetryMonitor {
    shared: Arc<Shared>,
}

impl TelemetryMonitor {
    pub fn new(probe: Arc<dyn TelemetryProbe>, config: TelemetryConfig) -> std::io::Result<Self> {
        let worker = ProbeWorker::spawn(probe)?;
        Ok(TelemetryMonitor {
            shared: Arc::new(Shared {
                config,
                latest: ArcSwap::from_pointee(TelemetrySnapshot::neutral()),
                probe: Mutex::new(ProbeState {
                    worker,
                    smoothed_kbps: None,
                }),
                subscribers: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
            }),
        })
    }

    /// Latest snapshot. Never blocks on the probe.
    pub fn sample(&self) -> TelemetrySnapshot {
        self.shared.latest.load().as_ref().clone()
    }

    /// Probe now and store the result. Falls back to the previous snapshot
    /// when the probe does not answer within the configured timeout.
    pub fn refresh(&self) -> TelemetrySnapshot {
        let mut state = self.shared.probe.lock().unwrap_or_else(|e| e.into_inner());
        let Some(reading) = state.worker.probe(self.shared.config.probe_timeout) else {
            warn!(
                timeout_ms = self.shared.config.probe_timeout.as_millis() as u64,
                "telemetry probe unavailable, reusing last snapshot"
            );
            return self.sample();
        };
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = merge_reading(
            &reading,
            &mut state.smoothed_kbps,
            self.shared.config.bandwidth_decay,
            sequence,
        );
        self.shared.latest.store(Arc::new(snapshot.clone()));
        snapshot
    }

    /// Register for snapshot notifications.
    pub fn subscribe(&self) -> Receiver<TelemetrySnapshot> {
        let (tx, rx) = unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Handle a discrete environment change: re-probe and publish.
    pub fn notify(&self, event: EnvironmentEvent) -> TelemetrySnapshot {
        debug!(?event, "environment change");
        let snapshot = self.refresh();
        self.publish(&snapshot);
        snapshot
    }

    /// Refresh and publish; one periodic poll.
    pub fn poll(&self) -> TelemetrySnapshot {
        let snapshot = self.refresh();
        self.publish(&snapshot);
        snapshot
    }

    fn publish(&self, snapshot: &TelemetrySnapshot) {
        let mut subs = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Start polling on the configured interval in a background thread.
    pub fn spawn_poller(&self) -> std::io::Result<TelemetryPoller> {
        let monitor = self.clone();
        let interval = self.shared.config.poll_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("tidal-telemetry".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                monitor.poll();
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            if stop_flag.load(Ordering::Relaxed) {
                                break;
                            }
                            monitor.poll();
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(TelemetryPoller {
            stop,
            stop_tx,
            handle: Some(handle),
        })
    }
}

/// Handle to the periodic polling thread. Stops on drop.
pub struct TelemetryPoller {
    stop: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TelemetryPoller {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill missing signals with neutral values and fold the bandwidth
/// measurement into the decayed estimate.
fn merge_reading(
    reading: &ProbeReading,
    smoothed_kbps: &mut Option<f64>,
    decay: f64,
    sequence: u64,
) -> TelemetrySnapshot {
    let neutral = TelemetrySnapshot::neutral();
    let measured = reading
        .bandwidth_kbps
        .filter(|v| v.is_finite() && *v >= 0.0);

    let bandwidth_kbps = match (measured, *smoothed_kbps) {
        (Some(m), Some(prev)) => decay * prev + (1.0 - decay) * m,
        (Some(m), None) => m,
        (None, Some(prev)) => prev,
        (None, None) => neutral.bandwidth_kbps,
    };
    if measured.is_some() {
        *smoothed_kbps = Some(bandwidth_kbps);
    }

    TelemetrySnapshot {
        bandwidth_kbps,
        measured_kbps: measured.unwrap_or(bandwidth_kbps),
        rtt_ms: reading.rtt_ms.unwrap_or(neutral.rtt_ms),
        network_class: reading.network_class.unwrap_or(neutral.network_class),
        data_saver: reading.data_saver.unwrap_or(false),
        cpu_load_pct: pct_or(reading.cpu_load_pct, neutral.cpu_load_pct),
        memory_usage_pct: pct_or(reading.memory_usage_pct, neutral.memory_usage_pct),
        battery_pct: pct_or(reading.battery_pct, neutral.battery_pct),
        is_charging: reading.is_charging.unwrap_or(false),
        device_tier: reading.device_tier.unwrap_or(neutral.device_tier),
        sequence,
    }
}

fn pct_or(value: Option<f64>, neutral: f64) -> f64 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0))
        .unwrap_or(neutral)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::system::FixedProbe;
    use crate::telemetry::NetworkClass;

    struct SlowProbe;

    impl TelemetryProbe for SlowProbe {
        fn read(&self) -> ProbeReading {
            thread::sleep(Duration::from_millis(300));
            ProbeReading {
                bandwidth_kbps: Some(42.0),
                ..Default::default()
            }
        }
    }

    fn config() -> TelemetryConfig {
        TelemetryConfig {
            poll_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(50),
            bandwidth_decay: 0.5,
        }
    }

    #[test]
    fn missing_signals_default_to_neutral() {
        let probe = Arc::new(FixedProbe::new(ProbeReading::default()));
        let monitor = TelemetryMonitor::new(probe, config()).unwrap();
        let snap = monitor.refresh();
        assert_eq!(snap.cpu_load_pct, TelemetrySnapshot::NEUTRAL_CPU_PCT);
        assert_eq!(snap.battery_pct, TelemetrySnapshot::NEUTRAL_BATTERY_PCT);
        assert_eq!(snap.bandwidth_kbps, TelemetrySnapshot::NEUTRAL_BANDWIDTH_KBPS);
        assert_eq!(snap.network_class, NetworkClass::Unknown);
        assert_eq!(snap.sequence, 1);
    }

    #[test]
    fn bandwidth_is_smoothed() {
        let probe = Arc::new(FixedProbe::new(ProbeReading {
            bandwidth_kbps: Some(1_000.0),
            ..Default::default()
        }));
        let monitor = TelemetryMonitor::new(probe.clone(), config()).unwrap();
        assert_eq!(monitor.refresh().bandwidth_kbps, 1_000.0);

        probe.set(ProbeReading {
            bandwidth_kbps: Some(2_000.0),
            ..Default::default()
        });
        let snap = monitor.refresh();
        // decay 0.5: 0.5 * 1000 + 0.5 * 2000
        assert!((snap.bandwidth_kbps - 1_500.0).abs() < 1e-9);
        assert_eq!(snap.measured_kbps, 2_000.0);
    }

    #[test]
    fn slow_probe_reuses_last_snapshot() {
        let monitor = TelemetryMonitor::new(Arc::new(SlowProbe), config()).unwrap();
        let start = Instant::now();
        let snap = monitor.refresh();
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(snap, TelemetrySnapshot::neutral());
    }

    #[test]
    fn environment_event_publishes() {
        let probe = Arc::new(FixedProbe::new(ProbeReading {
            battery_pct: Some(12.0),
            ..Default::default()
        }));
        let monitor = TelemetryMonitor::new(probe, config()).unwrap();
        let rx = monitor.subscribe();
        monitor.notify(EnvironmentEvent::BatteryChanged);
        let snap = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(snap.battery_pct, 12.0);
        assert_eq!(monitor.sample(), snap);
    }

    #[test]
    fn poller_delivers_periodic_snapshots() {
        let probe = Arc::new(FixedProbe::new(ProbeReading::default()));
        let monitor = TelemetryMonitor::new(probe, config()).unwrap();
        let rx = monitor.subscribe();
        let mut poller = monitor.spawn_poller().unwrap();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(second.sequence > first.sequence);
        poller.stop();
    }
}
