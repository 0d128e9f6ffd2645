//! # Tidal Delivery Simulator
//!
//! Drives the delivery runtime with a random-walk telemetry probe and a
//! lossy simulated transfer executor, logging every outbound event.
//!
//! ## Usage
//!
//! ```bash
//! # Two minutes of simulated conditions, 40 transfers
//! tidal-sim --duration-secs 120 --requests 40
//!
//! # Custom tuning and persisted settings
//! tidal-sim --config delivery.toml --settings settings.toml --loss 0.2
//!
//! # Dump Prometheus text on exit
//! tidal-sim --metrics
//!
//! # Real CPU/memory readings, JSON summary
//! tidal-sim --host-probe --json
//! ```

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use tidal_delivery::config::DeliveryConfig;
use tidal_delivery::error::{PipelineError, TransferError};
use tidal_delivery::metrics::render_prometheus;
use tidal_delivery::settings::{MemorySettingsStore, SettingsStore, TomlFileSettingsStore};
use tidal_delivery::telemetry::monitor::TelemetryMonitor;
use tidal_delivery::telemetry::system::SystemProbe;
use tidal_delivery::telemetry::{DeviceTier, NetworkClass, ProbeReading, TelemetryProbe};
use tidal_delivery::transfer::{Priority, TransferRequest};
use tidal_delivery::{
    AdaptiveDeliveryController, AppliedProfile, CancelFlag, DeliveryEvent, DeliveryRuntime,
    QualityPipeline, RuntimeOptions, TransferExecutor,
};

/// Adaptive delivery simulator.
#[derive(Parser, Debug)]
#[command(name = "tidal-sim", about = "Simulate the adaptive delivery controller")]
struct Cli {
    /// Delivery configuration TOML.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Persist user settings to this TOML file.
    #[arg(long)]
    settings: Option<std::path::PathBuf>,

    /// Simulated run time in seconds.
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Telemetry poll interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Number of transfer requests to issue.
    #[arg(long, default_value_t = 20)]
    requests: u64,

    /// Probability that a transfer attempt fails.
    #[arg(long, default_value_t = 0.1)]
    loss: f64,

    /// RNG seed.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Print Prometheus metrics on exit.
    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// Print final statistics as JSON on exit.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Read CPU and memory from this host instead of the random walk.
    #[arg(long, default_value_t = false)]
    host_probe: bool,
}

// ── Simulated collaborators ─────────────────────────────────────

struct WalkState {
    rng: StdRng,
    bandwidth_kbps: f64,
    cpu_pct: f64,
    memory_pct: f64,
    battery_pct: f64,
}

/// Conditions drift by bounded random steps each read.
struct RandomWalkProbe {
    state: Mutex<WalkState>,
}

impl RandomWalkProbe {
    fn new(seed: u64) -> Self {
        RandomWalkProbe {
            state: Mutex::new(WalkState {
                rng: StdRng::seed_from_u64(seed),
                bandwidth_kbps: 1_200.0,
                cpu_pct: 40.0,
                memory_pct: 50.0,
                battery_pct: 90.0,
            }),
        }
    }
}

impl TelemetryProbe for RandomWalkProbe {
    fn read(&self) -> ProbeReading {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let bw_step = s.rng.random_range(-250.0..250.0);
        s.bandwidth_kbps = (s.bandwidth_kbps + bw_step).clamp(50.0, 5_000.0);
        let cpu_step = s.rng.random_range(-8.0..8.0);
        s.cpu_pct = (s.cpu_pct + cpu_step).clamp(0.0, 100.0);
        let mem_step = s.rng.random_range(-5.0..5.0);
        s.memory_pct = (s.memory_pct + mem_step).clamp(0.0, 100.0);
        s.battery_pct = (s.battery_pct - s.rng.random_range(0.0..0.5)).max(0.0);

        let network_class = match s.bandwidth_kbps {
            b if b < 100.0 => NetworkClass::Cellular2g,
            b if b < 700.0 => NetworkClass::Cellular3g,
            b if b < 2_500.0 => NetworkClass::Cellular4g,
            _ => NetworkClass::Wifi,
        };

        ProbeReading {
            bandwidth_kbps: Some(s.bandwidth_kbps),
            rtt_ms: Some(s.rng.random_range(20.0..300.0)),
            network_class: Some(network_class),
            data_saver: Some(false),
            cpu_load_pct: Some(s.cpu_pct),
            memory_usage_pct: Some(s.memory_pct),
            battery_pct: Some(s.battery_pct),
            is_charging: Some(false),
            device_tier: Some(DeviceTier::Mid),
        }
    }
}

struct LoggingPipeline;

impl QualityPipeline for LoggingPipeline {
    fn apply(&mut self, applied: &AppliedProfile) -> Result<(), PipelineError> {
        let enabled: Vec<_> = applied
            .features
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| format!("{name:?}"))
            .collect();
        tracing::info!(
            profile = applied.profile.id(),
            bitrate_kbps = applied.profile.bitrate_kbps,
            strategy = applied.strategy,
            features = %enabled.join(","),
            "pipeline reconfigured"
        );
        Ok(())
    }
}

/// Sleeps for the transfer's nominal duration and fails at random.
struct LossyExecutor {
    loss: f64,
    rng: Mutex<StdRng>,
}

impl TransferExecutor for LossyExecutor {
    fn execute(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
    ) -> Result<Bytes, TransferError> {
        let kbps = request.estimated_bandwidth_kbps.max(1.0);
        let millis = ((request.size_bytes as f64 * 8.0) / kbps).min(2_000.0) as u64;
        let mut remaining = Duration::from_millis(millis);
        let step = Duration::from_millis(20);
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let slice = remaining.min(step);
            thread::sleep(slice);
            remaining -= slice;
        }
        let failed = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .random_bool(self.loss.clamp(0.0, 1.0));
        if failed {
            return Err(TransferError::Failed("simulated loss".into()));
        }
        Ok(Bytes::from(vec![0u8; request.size_bytes as usize]))
    }
}

// ── Main ────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            DeliveryConfig::from_toml_str(&text)?
        }
        None => DeliveryConfig::default(),
    };
    config.telemetry.poll_interval = Duration::from_millis(cli.poll_ms.max(1));

    let settings: Box<dyn SettingsStore> = match &cli.settings {
        Some(path) => Box::new(TomlFileSettingsStore::open(path)?),
        None => Box::new(MemorySettingsStore::new()),
    };

    tracing::info!(
        duration_secs = cli.duration_secs,
        requests = cli.requests,
        loss = cli.loss,
        seed = cli.seed,
        "tidal-sim starting"
    );

    let probe: Arc<dyn TelemetryProbe> = if cli.host_probe {
        Arc::new(SystemProbe::new())
    } else {
        Arc::new(RandomWalkProbe::new(cli.seed))
    };
    let monitor = TelemetryMonitor::new(probe, config.telemetry.clone())?;
    let controller =
        AdaptiveDeliveryController::new(config, monitor, Box::new(LoggingPipeline), settings);
    let executor = Arc::new(LossyExecutor {
        loss: cli.loss,
        rng: Mutex::new(StdRng::seed_from_u64(cli.seed.wrapping_add(1))),
    });

    let mut runtime = DeliveryRuntime::spawn(controller, executor, RuntimeOptions::default())?;
    let events = runtime.subscribe()?;

    let total = Duration::from_secs(cli.duration_secs);
    let spacing = total / (cli.requests.max(1) as u32 + 1);
    let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(2));
    let started = std::time::Instant::now();
    let mut issued = 0u64;

    while started.elapsed() < total {
        if issued < cli.requests && started.elapsed() >= spacing * (issued as u32 + 1) {
            let priority = match rng.random_range(0..10) {
                0 => Priority::Essential,
                1..=2 => Priority::Important,
                3..=7 => Priority::Normal,
                _ => Priority::Low,
            };
            // Reuse keys so later requests can be served from cache.
            let key = format!("segment-{}", rng.random_range(0..cli.requests.max(1) / 2 + 1));
            let size = rng.random_range(16_000..256_000);
            let request = TransferRequest::new(issued, key, size, rng.random_range(64.0..512.0))
                .with_priority(priority);
            runtime.add_request(request)?;
            issued += 1;
        }

        match events.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => log_event(&event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = runtime.stats();
    tracing::info!(
        level = %stats.level,
        strategy = stats.strategy,
        completed = stats.transfers_completed,
        failed = stats.transfers_failed,
        cache_hits = stats.cache_hits,
        "tidal-sim finished"
    );
    if cli.metrics {
        print!("{}", render_prometheus(&stats));
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    runtime.shutdown();
    Ok(())
}

fn log_event(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::QualityChanged { from, to, reason } => {
            tracing::info!(%from, %to, %reason, "quality changed");
        }
        DeliveryEvent::QualityChangeFailed { attempted, error } => {
            tracing::warn!(%attempted, %error, "quality change failed");
        }
        DeliveryEvent::StrategyChanged(s) => {
            tracing::info!(
                strategy = s.name,
                max_bitrate_kbps = s.max_bitrate_kbps,
                "strategy changed"
            );
        }
        DeliveryEvent::ProfileRefreshFailed { level, strategy, error } => {
            tracing::warn!(%level, strategy, %error, "profile refresh failed");
        }
        DeliveryEvent::TransferCompleted { id, key, payload, from_cache } => {
            tracing::info!(%id, %key, bytes = payload.len(), from_cache, "transfer completed");
        }
        DeliveryEvent::TransferRetrying { id, retry_count, priority } => {
            tracing::info!(%id, retry_count, priority = priority.as_str(), "transfer retrying");
        }
        DeliveryEvent::TransferFailed { id, key, retry_count, error } => {
            tracing::warn!(%id, %key, retry_count, %error, "transfer failed");
        }
        DeliveryEvent::TransferCancelled { id } => {
            tracing::info!(%id, "transfer cancelled");
        }
    }
}
