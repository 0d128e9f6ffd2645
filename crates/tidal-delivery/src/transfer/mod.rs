//! Content transfers: request model, admission scheduling and the bounded
//! cache that results land in.

pub mod cache;
pub mod scheduler;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-assigned request identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer importance. Ordered so that `Essential` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    Important,
    Essential,
}

impl Priority {
    /// One level down, floored at `Low`.
    pub fn demote(self) -> Priority {
        match self {
            Priority::Essential => Priority::Important,
            Priority::Important => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Important => "important",
            Priority::Essential => "essential",
        }
    }
}

/// A pending content transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub id: TransferId,
    /// Cache key of the content (payload reference).
    pub key: String,
    pub size_bytes: u64,
    pub priority: Priority,
    pub estimated_bandwidth_kbps: f64,
    /// Failed attempts so far. Never decreases for a given id.
    pub retry_count: u32,
    /// Speculative prefetch; held while the strategy disallows preloading.
    pub preload: bool,
}

impl TransferRequest {
    pub fn new(
        id: u64,
        key: impl Into<String>,
        size_bytes: u64,
        estimated_bandwidth_kbps: f64,
    ) -> Self {
        TransferRequest {
            id: TransferId(id),
            key: key.into(),
            size_bytes,
            priority: Priority::Normal,
            estimated_bandwidth_kbps,
            retry_count: 0,
            preload: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_preload(mut self) -> Self {
        self.preload = true;
        self
    }
}
