//! Adaptive delivery controller.
//!
//! This crate contains:
//! - **Telemetry** — probed network, compute and power conditions with neutral fallbacks
//! - **Quality catalog** — fixed fidelity tiers and per-feature gates
//! - **Adaptation** — classification, scoring and the tier state machine
//! - **Strategy** — connectivity-driven transfer policy
//! - **Transfers** — bandwidth-budgeted admission with retries, and a bounded content cache
//! - **Controller / runtime** — the single owner of all decision state and its worker thread

pub mod adaptation;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod quality;
pub mod runtime;
pub mod settings;
pub mod strategy;
pub mod telemetry;
pub mod transfer;

pub use controller::{AdaptiveDeliveryController, AppliedProfile, DeliveryEvent, QualityPipeline};
pub use runtime::{CancelFlag, DeliveryRuntime, RuntimeOptions, TransferExecutor};
