//! # Delivery Runtime
//!
//! Thread-safe handle around an [`AdaptiveDeliveryController`]. A single
//! worker thread owns the controller and drains, via `crossbeam_channel::select!`:
//!
//! - telemetry snapshots published by the monitor,
//! - outcomes of running transfers,
//! - control commands from handles,
//! - a maintenance tick (cache expiry sweep).
//!
//! After every message the worker runs one admission pass and starts a
//! thread per admitted transfer through the [`TransferExecutor`].
//!
//! Dropping the runtime stops the telemetry poller and joins the worker.
//! Transfer threads still running at that point are detached; their late
//! outcomes are discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, never, tick, unbounded};
use tracing::{debug, info, warn};

use crate::adaptation::{AdaptationMode, Algorithm, UserBias};
use crate::controller::{AdaptiveDeliveryController, DeliveryEvent, DeliveryStats};
use crate::error::TransferError;
use crate::quality::QualityLevel;
use crate::telemetry::monitor::{TelemetryMonitor, TelemetryPoller};
use crate::telemetry::{EnvironmentEvent, TelemetrySnapshot};
use crate::transfer::scheduler::CancelOutcome;
use crate::transfer::{Priority, TransferId, TransferRequest};

/// Cooperative cancellation signal shared with a running transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Performs one transfer attempt. Runs on its own thread; should poll
/// `cancel` and return [`TransferError::Cancelled`] promptly once set.
pub trait TransferExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
    ) -> Result<Bytes, TransferError>;
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Cache sweep and admission retry cadence.
    pub maintenance_interval: Duration,
    /// Start the monitor's periodic poller. Disable when the host pushes
    /// snapshots itself via [`DeliveryRuntime::push_telemetry`].
    pub poll_telemetry: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            maintenance_interval: Duration::from_secs(1),
            poll_telemetry: true,
        }
    }
}

enum Command {
    Telemetry(TelemetrySnapshot),
    Evaluate,
    AddRequest(TransferRequest),
    Prioritize(TransferId, Priority),
    Cancel(TransferId),
    SetLevel(QualityLevel),
    SetMode(AdaptationMode),
    SetAlgorithm(Algorithm),
    SetUserBias(UserBias),
    SetManualOverride(bool),
    Invalidate(String),
    Subscribe(Sender<DeliveryEvent>),
    Shutdown,
}

struct TransferOutcome {
    id: TransferId,
    result: Result<Bytes, TransferError>,
}

/// Handle to the delivery worker.
pub struct DeliveryRuntime {
    command_tx: Sender<Command>,
    monitor: TelemetryMonitor,
    stats: Arc<Mutex<DeliveryStats>>,
    poller: Option<TelemetryPoller>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeliveryRuntime {
    pub fn spawn(
        controller: AdaptiveDeliveryController,
        executor: Arc<dyn TransferExecutor>,
        options: RuntimeOptions,
    ) -> anyhow::Result<Self> {
        let monitor = controller.monitor().clone();
        let telemetry_rx = monitor.subscribe();
        let (command_tx, command_rx) = bounded(256);
        let stats = Arc::new(Mutex::new(controller.stats()));
        let stats_clone = stats.clone();

        let worker = Worker {
            controller,
            executor,
            subscribers: Vec::new(),
            cancel_flags: HashMap::new(),
            stats: stats_clone,
        };
        let interval = options.maintenance_interval;
        let handle = thread::Builder::new()
            .name("tidal-delivery".into())
            .spawn(move || worker.run(telemetry_rx, command_rx, interval))
            .map_err(|e| anyhow::anyhow!("Failed to spawn delivery worker: {}", e))?;

        let poller = if options.poll_telemetry {
            Some(
                monitor
                    .spawn_poller()
                    .map_err(|e| anyhow::anyhow!("Failed to spawn telemetry poller: {}", e))?,
            )
        } else {
            None
        };

        Ok(DeliveryRuntime {
            command_tx,
            monitor,
            stats,
            poller,
            handle: Some(handle),
        })
    }

    fn send(&self, command: Command, what: &str) -> anyhow::Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| anyhow::anyhow!("Failed to {}: {}", what, e))
    }

    /// Register for outbound events.
    pub fn subscribe(&self) -> anyhow::Result<Receiver<DeliveryEvent>> {
        let (tx, rx) = unbounded();
        self.send(Command::Subscribe(tx), "subscribe")?;
        Ok(rx)
    }

    /// Feed a snapshot observed by the host.
    pub fn push_telemetry(&self, snapshot: TelemetrySnapshot) -> anyhow::Result<()> {
        self.send(Command::Telemetry(snapshot), "push telemetry")
    }

    /// Re-probe immediately. The snapshot reaches the worker via the
    /// monitor's subscription.
    pub fn notify(&self, event: EnvironmentEvent) -> TelemetrySnapshot {
        self.monitor.notify(event)
    }

    pub fn evaluate(&self) -> anyhow::Result<()> {
        self.send(Command::Evaluate, "request evaluation")
    }

    pub fn add_request(&self, request: TransferRequest) -> anyhow::Result<()> {
        self.send(Command::AddRequest(request), "add request")
    }

    pub fn prioritize(&self, id: TransferId, priority: Priority) -> anyhow::Result<()> {
        self.send(Command::Prioritize(id, priority), "prioritize request")
    }

    pub fn cancel(&self, id: TransferId) -> anyhow::Result<()> {
        self.send(Command::Cancel(id), "cancel request")
    }

    pub fn set_level(&self, level: QualityLevel) -> anyhow::Result<()> {
        self.send(Command::SetLevel(level), "set level")
    }

    pub fn set_mode(&self, mode: AdaptationMode) -> anyhow::Result<()> {
        self.send(Command::SetMode(mode), "set mode")
    }

    pub fn set_algorithm(&self, algorithm: Algorithm) -> anyhow::Result<()> {
        self.send(Command::SetAlgorithm(algorithm), "set algorithm")
    }

    pub fn set_user_bias(&self, bias: UserBias) -> anyhow::Result<()> {
        self.send(Command::SetUserBias(bias), "set user bias")
    }

    pub fn set_manual_override(&self, enabled: bool) -> anyhow::Result<()> {
        self.send(Command::SetManualOverride(enabled), "set manual override")
    }

    pub fn invalidate(&self, key: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Invalidate(key.into()), "invalidate cache entry")
    }

    /// Stats as of the worker's last iteration.
    pub fn stats(&self) -> DeliveryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn monitor(&self) -> &TelemetryMonitor {
        &self.monitor
    }

    /// Stops the poller and the worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeliveryRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    controller: AdaptiveDeliveryController,
    executor: Arc<dyn TransferExecutor>,
    subscribers: Vec<Sender<DeliveryEvent>>,
    cancel_flags: HashMap<TransferId, CancelFlag>,
    stats: Arc<Mutex<DeliveryStats>>,
}

impl Worker {
    fn run(
        mut self,
        mut telemetry_rx: Receiver<TelemetrySnapshot>,
        command_rx: Receiver<Command>,
        interval: Duration,
    ) {
        let (outcome_tx, outcome_rx) = unbounded::<TransferOutcome>();
        let ticker = tick(interval);
        let mut telemetry_closed = false;

        loop {
            crossbeam_channel::select! {
                recv(telemetry_rx) -> msg => match msg {
                    Ok(snapshot) => {
                        let events = self.controller.on_telemetry(snapshot);
                        self.emit(events);
                    }
                    Err(_) => telemetry_closed = true,
                },
                recv(outcome_rx) -> msg => {
                    if let Ok(outcome) = msg {
                        self.on_outcome(outcome);
                    }
                }
                recv(command_rx) -> msg => match msg {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.on_command(command),
                },
                recv(ticker) -> _ => {
                    let expired = self.controller.sweep_cache();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "expired cache entries swept");
                    }
                }
            }
            if telemetry_closed {
                telemetry_rx = never();
                telemetry_closed = false;
            }

            self.admit(&outcome_tx);
            *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = self.controller.stats();
        }

        for flag in self.cancel_flags.values() {
            flag.cancel();
        }
        info!("delivery worker stopped");
    }

    fn on_command(&mut self, command: Command) {
        let events = match command {
            Command::Telemetry(snapshot) => self.controller.on_telemetry(snapshot),
            Command::Evaluate => self.controller.evaluate(),
            Command::AddRequest(request) => self.controller.add_request(request),
            Command::Prioritize(id, priority) => {
                if !self.controller.prioritize(id, priority) {
                    debug!(%id, "prioritize ignored, request not queued");
                }
                Vec::new()
            }
            Command::Cancel(id) => {
                if self.controller.cancel(id) == CancelOutcome::Signalled {
                    if let Some(flag) = self.cancel_flags.get(&id) {
                        flag.cancel();
                    }
                }
                Vec::new()
            }
            Command::SetLevel(level) => self.controller.set_level(level),
            Command::SetMode(mode) => {
                self.controller.set_mode(mode);
                Vec::new()
            }
            Command::SetAlgorithm(algorithm) => {
                self.controller.set_algorithm(algorithm);
                Vec::new()
            }
            Command::SetUserBias(bias) => {
                self.controller.set_user_bias(bias);
                Vec::new()
            }
            Command::SetManualOverride(enabled) => {
                self.controller.set_manual_override(enabled);
                Vec::new()
            }
            Command::Invalidate(key) => {
                self.controller.invalidate(&key);
                Vec::new()
            }
            Command::Subscribe(tx) => {
                self.subscribers.push(tx);
                Vec::new()
            }
            Command::Shutdown => Vec::new(),
        };
        self.emit(events);
    }

    fn on_outcome(&mut self, outcome: TransferOutcome) {
        self.cancel_flags.remove(&outcome.id);
        let events = match outcome.result {
            Ok(payload) => self.controller.on_transfer_completed(outcome.id, payload),
            Err(error) => {
                debug!(id = %outcome.id, %error, "transfer attempt failed");
                self.controller.on_transfer_failed(outcome.id, error)
            }
        };
        self.emit(events);
    }

    fn admit(&mut self, outcome_tx: &Sender<TransferOutcome>) {
        let pass = self.controller.run_scheduler_pass();
        for request in pass.admitted {
            let id = request.id;
            let flag = CancelFlag::default();
            let executor = self.executor.clone();
            let tx = outcome_tx.clone();
            let thread_flag = flag.clone();
            let spawned = thread::Builder::new()
                .name(format!("tidal-xfer-{}", id.0))
                .spawn(move || {
                    let result = executor.execute(&request, &thread_flag);
                    let _ = tx.send(TransferOutcome { id, result });
                });
            match spawned {
                Ok(_) => {
                    self.cancel_flags.insert(id, flag);
                }
                Err(e) => {
                    warn!(%id, error = %e, "failed to spawn transfer thread");
                    let events = self
                        .controller
                        .on_transfer_failed(id, TransferError::Failed(e.to_string()));
                    self.emit(events);
                }
            }
        }
    }

    fn emit(&mut self, events: Vec<DeliveryEvent>) {
        for event in events {
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
