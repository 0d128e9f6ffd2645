//! # Transfer Scheduler
//!
//! Greedy, priority-first, non-preemptive admission against a bandwidth
//! budget.
//!
//! ## Pass
//!
//! 1. Sort the queue by priority (descending), then size (ascending).
//! 2. `budget = measured × (1 − reserved_fraction) − committed`.
//! 3. Walk the queue admitting while the next estimate fits the remaining
//!    budget; the first item that does not fit stops the pass.
//!
//! Requests held by the active strategy (low priority under
//! `prioritize_essential`, preloads when preloading is off) are stepped
//! over and stay queued.
//!
//! Failures are retried with the priority demoted one level, up to
//! `max_retries` retries after the first attempt. Dropped and cancelled
//! ids keep their retry count in a bounded ledger so a re-add resumes
//! from it; the oldest entries are forgotten once the ledger is full.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use super::{Priority, TransferId, TransferRequest};
use crate::config::SchedulerConfig;
use crate::strategy::Strategy;

struct InFlight {
    request: TransferRequest,
    cancelled: bool,
}

/// Result of one admission pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmissionPass {
    /// Budget computed at pass start (kbps).
    pub budget_kbps: f64,
    pub admitted: Vec<TransferRequest>,
}

impl AdmissionPass {
    pub fn admitted_kbps(&self) -> f64 {
        self.admitted
            .iter()
            .map(|r| r.estimated_bandwidth_kbps)
            .sum()
    }
}

/// What happened to a request after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Demoted and back in the queue.
    Requeued(TransferRequest),
    /// Retry bound exhausted; permanently failed.
    Dropped(TransferRequest),
    /// Cancelled while in flight; not retried.
    Cancelled(TransferRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue.
    Dequeued,
    /// Already running; flagged so a later failure is not retried.
    Signalled,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub admitted: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct TransferScheduler {
    config: SchedulerConfig,
    queue: Vec<TransferRequest>,
    in_flight: HashMap<TransferId, InFlight>,
    committed_kbps: f64,
    /// Highest retry count per dropped or cancelled id, so re-adding never
    /// resets it. `ledger_order` is oldest first.
    retry_ledger: HashMap<TransferId, u32>,
    ledger_order: VecDeque<TransferId>,
    stats: SchedulerStats,
}

impl TransferScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        TransferScheduler {
            config,
            queue: Vec::new(),
            in_flight: HashMap::new(),
            committed_kbps: 0.0,
            retry_ledger: HashMap::new(),
            ledger_order: VecDeque::new(),
            stats: SchedulerStats::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a request. Returns `false` (no-op) if the id is already queued
    /// or in flight.
    pub fn add_request(&mut self, mut request: TransferRequest) -> bool {
        if self.contains(request.id) {
            debug!(id = %request.id, "duplicate transfer request ignored");
            return false;
        }
        let kbps = request.estimated_bandwidth_kbps;
        if !kbps.is_finite() || kbps < 0.0 {
            request.estimated_bandwidth_kbps = 0.0;
        }
        if let Some(seen) = self.forget_retries(request.id) {
            request.retry_count = request.retry_count.max(seen);
        }
        self.queue.push(request);
        self.sort_queue();
        true
    }

    /// Change a queued request's priority. No-op for unknown ids.
    pub fn prioritize(&mut self, id: TransferId, priority: Priority) -> bool {
        let Some(req) = self.queue.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        req.priority = priority;
        self.sort_queue();
        true
    }

    pub fn cancel(&mut self, id: TransferId) -> CancelOutcome {
        if let Some(pos) = self.queue.iter().position(|r| r.id == id) {
            let req = self.queue.remove(pos);
            self.remember_retries(id, req.retry_count);
            self.stats.cancelled += 1;
            return CancelOutcome::Dequeued;
        }
        if let Some(flight) = self.in_flight.get_mut(&id) {
            flight.cancelled = true;
            return CancelOutcome::Signalled;
        }
        CancelOutcome::Unknown
    }

    /// Run one admission pass against `measured_kbps` of total bandwidth.
    pub fn pass(&mut self, measured_kbps: f64, strategy: &Strategy) -> AdmissionPass {
        let budget = self.available_budget(measured_kbps);
        if self.queue.is_empty() {
            return AdmissionPass {
                budget_kbps: budget,
                admitted: Vec::new(),
            };
        }
        self.sort_queue();

        let mut remaining = budget;
        let mut admit_idx = Vec::new();
        for (idx, req) in self.queue.iter().enumerate() {
            if held_by(strategy, req) {
                continue;
            }
            if req.estimated_bandwidth_kbps > remaining {
                break;
            }
            remaining -= req.estimated_bandwidth_kbps;
            admit_idx.push(idx);
        }

        let mut admitted = Vec::with_capacity(admit_idx.len());
        for idx in admit_idx.into_iter().rev() {
            admitted.push(self.queue.remove(idx));
        }
        admitted.reverse();

        for req in &admitted {
            self.committed_kbps += req.estimated_bandwidth_kbps;
            self.stats.admitted += 1;
            self.in_flight.insert(
                req.id,
                InFlight {
                    request: req.clone(),
                    cancelled: false,
                },
            );
        }
        if !admitted.is_empty() {
            debug!(
                budget_kbps = budget,
                admitted = admitted.len(),
                queued = self.queue.len(),
                "admission pass"
            );
        }

        AdmissionPass {
            budget_kbps: budget,
            admitted,
        }
    }

    /// Mark an in-flight transfer as done. `None` for unknown ids.
    pub fn complete(&mut self, id: TransferId) -> Option<TransferRequest> {
        let flight = self.in_flight.remove(&id)?;
        self.release(&flight.request);
        self.forget_retries(id);
        self.stats.completed += 1;
        Some(flight.request)
    }

    /// Record a failed attempt: demote and requeue, or drop past the bound.
    pub fn fail(&mut self, id: TransferId) -> Option<FailureOutcome> {
        let flight = self.in_flight.remove(&id)?;
        self.release(&flight.request);
        let mut req = flight.request;

        req.retry_count += 1;

        if flight.cancelled {
            self.remember_retries(id, req.retry_count);
            self.stats.cancelled += 1;
            return Some(FailureOutcome::Cancelled(req));
        }

        if req.retry_count <= self.config.max_retries {
            req.priority = req.priority.demote();
            self.stats.retried += 1;
            debug!(
                id = %id,
                retry = req.retry_count,
                priority = req.priority.as_str(),
                "transfer requeued"
            );
            self.queue.push(req.clone());
            self.sort_queue();
            Some(FailureOutcome::Requeued(req))
        } else {
            self.remember_retries(id, req.retry_count);
            self.stats.failed += 1;
            warn!(
                id = %id,
                retries = req.retry_count,
                key = %req.key,
                "transfer permanently failed"
            );
            Some(FailureOutcome::Dropped(req))
        }
    }

    fn remember_retries(&mut self, id: TransferId, retry_count: u32) {
        if self.retry_ledger.insert(id, retry_count).is_some() {
            self.ledger_order.retain(|&seen| seen != id);
        }
        self.ledger_order.push_back(id);
        while self.ledger_order.len() > self.config.retry_ledger_capacity {
            if let Some(oldest) = self.ledger_order.pop_front() {
                self.retry_ledger.remove(&oldest);
            }
        }
    }

    fn forget_retries(&mut self, id: TransferId) -> Option<u32> {
        let seen = self.retry_ledger.remove(&id)?;
        self.ledger_order.retain(|&other| other != id);
        Some(seen)
    }

    /// Ids whose retry count is remembered after leaving the scheduler.
    pub fn retry_ledger_len(&self) -> usize {
        self.retry_ledger.len()
    }

    pub fn available_budget(&self, measured_kbps: f64) -> f64 {
        let usable = measured_kbps.max(0.0) * (1.0 - self.config.reserved_fraction);
        (usable - self.committed_kbps).max(0.0)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.in_flight.contains_key(&id) || self.queue.iter().any(|r| r.id == id)
    }

    pub fn is_queued(&self, id: TransferId) -> bool {
        self.queue.iter().any(|r| r.id == id)
    }

    pub fn is_in_flight(&self, id: TransferId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Queue in admission order.
    pub fn queued(&self) -> &[TransferRequest] {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn committed_kbps(&self) -> f64 {
        self.committed_kbps
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    fn release(&mut self, req: &TransferRequest) {
        let next = self.committed_kbps - req.estimated_bandwidth_kbps;
        debug_assert!(next > -1e-6, "committed bandwidth underflow: {next}");
        self.committed_kbps = if self.in_flight.is_empty() {
            0.0
        } else {
            next.max(0.0)
        };
    }

    fn sort_queue(&mut self) {
        self.queue.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.size_bytes.cmp(&b.size_bytes))
                .then(a.id.cmp(&b.id))
        });
    }
}

fn held_by(strategy: &Strategy, req: &TransferRequest) -> bool {
    (strategy.prioritize_essential && req.priority == Priority::Low)
        || (req.preload && !strategy.allow_preload)
}
