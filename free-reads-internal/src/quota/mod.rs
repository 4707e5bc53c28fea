//! Free-view quota: a per-user counter of views left in a sliding window, plus the set of
//! documents already charged in that window so that re-reading one never costs again.
//!
//! Two interchangeable backends implement [`QuotaBackend`]: [`RedisQuotaStore`] (durable,
//! shared across instances, atomic via server-side Lua) and [`LocalQuotaStore`] (process-local,
//! used only when no durable store is configured). [`QuotaEngine`] owns exactly one of them for
//! the lifetime of the process.

pub mod clock;
pub mod engine;
pub mod local;
pub mod redis;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::Error;

pub use clock::{Clock, SystemClock};
pub use engine::{normalize_seed_amount, QuotaEngine, QuotaMetrics, QuotaMetricsSnapshot};
pub use local::LocalQuotaStore;
pub use redis::RedisQuotaStore;
pub use state::QuotaState;

/// Quota parameters shared by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    default_remaining: u32,
    window: Duration,
}

impl QuotaPolicy {
    pub fn new(default_remaining: u32, window: Duration) -> Self {
        Self {
            default_remaining,
            window,
        }
    }

    pub fn default_remaining(&self) -> u32 {
        self.default_remaining
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Expiration of a record touched at `now`
    pub fn expires_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(24 * 60 * 60))
    }
}

/// Read-only view of a user's quota record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub remaining: u32,
    pub consumed: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DenyReason {
    /// No views left and the document has not been seen in this window
    Limit,
}

/// Outcome of trying to consume one quota unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// `charged` is false when the document was already consumed in this window
    Allow {
        snapshot: QuotaSnapshot,
        charged: bool,
    },
    Deny { reason: DenyReason },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow { .. })
    }

    pub fn remaining(&self) -> u32 {
        match self {
            QuotaDecision::Allow { snapshot, .. } => snapshot.remaining,
            QuotaDecision::Deny { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    Redis,
    Local,
}

/// Storage capability behind the quota engine.
///
/// Every method must be atomic per user: concurrent calls for one user are linearizable,
/// calls for different users never wait on each other beyond what the store imposes.
/// Callers pass already-normalized user ids and validated document ids.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Current record, lazily creating a default one when absent or lapsed.
    /// A live record's expiration is left untouched.
    async fn inspect(&self, user_id: &str) -> Result<QuotaSnapshot, Error>;

    async fn consume(&self, user_id: &str, doc_id: &str) -> Result<QuotaDecision, Error>;

    /// Restore the default allowance and forget the consumed set
    async fn reset(&self, user_id: &str) -> Result<QuotaSnapshot, Error>;

    /// Overwrite `remaining` keeping the consumed set, refreshing both expirations
    async fn seed(&self, user_id: &str, remaining: u32) -> Result<QuotaSnapshot, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}
