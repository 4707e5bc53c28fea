use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::{Error, ErrorDetails};
use crate::quota::{BackendKind, QuotaBackend, QuotaDecision, QuotaPolicy, QuotaSnapshot};

/// Counters for quota outcomes, mirrored into the Prometheus recorder when one is installed
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub charged: AtomicU64,
    pub repeat: AtomicU64,
    pub denied: AtomicU64,
    pub backend_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaMetricsSnapshot {
    pub charged: u64,
    pub repeat: u64,
    pub denied: u64,
    pub backend_errors: u64,
}

impl QuotaMetrics {
    pub fn record_charged(&self) {
        self.charged.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("free_reads_consume_total", "outcome" => "charged").increment(1);
    }

    pub fn record_repeat(&self) {
        self.repeat.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("free_reads_consume_total", "outcome" => "repeat").increment(1);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("free_reads_consume_total", "outcome" => "denied").increment(1);
    }

    pub fn record_backend_error(&self, operation: &'static str) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("free_reads_backend_errors_total", "operation" => operation)
            .increment(1);
    }

    pub fn snapshot(&self) -> QuotaMetricsSnapshot {
        QuotaMetricsSnapshot {
            charged: self.charged.load(Ordering::Relaxed),
            repeat: self.repeat.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Clamp a caller-supplied seed amount into a counter value.
///
/// Missing or non-finite amounts fall back to `default`; fractional amounts are floored and
/// negative ones become zero.
pub fn normalize_seed_amount(amount: Option<f64>, default: u32) -> u32 {
    match amount {
        Some(amount) if amount.is_finite() => {
            let floored = amount.floor();
            if floored <= 0.0 {
                0
            } else if floored >= f64::from(u32::MAX) {
                u32::MAX
            } else {
                floored as u32
            }
        }
        _ => default,
    }
}

/// Entry point for every quota operation. Normalizes identities, validates arguments and
/// delegates to the single backend chosen at startup.
pub struct QuotaEngine {
    backend: Arc<dyn QuotaBackend>,
    policy: QuotaPolicy,
    anonymous_user_id: String,
    metrics: Arc<QuotaMetrics>,
}

impl QuotaEngine {
    pub fn new(
        backend: Arc<dyn QuotaBackend>,
        policy: QuotaPolicy,
        anonymous_user_id: impl Into<String>,
    ) -> Self {
        let engine = Self {
            backend,
            policy,
            anonymous_user_id: anonymous_user_id.into(),
            metrics: Arc::new(QuotaMetrics::default()),
        };
        info!(
            backend = %engine.backend.kind(),
            default_remaining = policy.default_remaining(),
            window_ms = policy.window_ms(),
            "Quota engine ready"
        );
        engine
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<QuotaMetrics> {
        &self.metrics
    }

    /// Map absent or blank user ids onto the anonymous partition
    pub fn normalize_user_id<'a>(&'a self, user_id: Option<&'a str>) -> &'a str {
        match user_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => &self.anonymous_user_id,
        }
    }

    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn inspect(&self, user_id: Option<&str>) -> Result<QuotaSnapshot, Error> {
        let user_id = self.normalize_user_id(user_id);
        self.observe("inspect", self.backend.inspect(user_id).await)
    }

    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn consume(
        &self,
        user_id: Option<&str>,
        doc_id: Option<&str>,
    ) -> Result<QuotaDecision, Error> {
        let doc_id = match doc_id {
            Some(doc_id) if !doc_id.trim().is_empty() => doc_id,
            _ => {
                return Err(Error::new(ErrorDetails::InvalidArgument {
                    field: "docId".to_string(),
                    message: "docId is required to consume a free view".to_string(),
                }))
            }
        };
        let user_id = self.normalize_user_id(user_id);
        let decision = self.observe("consume", self.backend.consume(user_id, doc_id).await)?;
        match &decision {
            QuotaDecision::Allow { charged: true, snapshot } => {
                self.metrics.record_charged();
                debug!(user_id, doc_id, remaining = snapshot.remaining, "Free view charged");
            }
            QuotaDecision::Allow { charged: false, .. } => {
                self.metrics.record_repeat();
                debug!(user_id, doc_id, "Repeat view, not charged");
            }
            QuotaDecision::Deny { reason } => {
                self.metrics.record_denied();
                info!(user_id, doc_id, %reason, "Free view denied");
            }
        }
        Ok(decision)
    }

    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn reset(&self, user_id: Option<&str>) -> Result<QuotaSnapshot, Error> {
        let user_id = self.normalize_user_id(user_id);
        let snapshot = self.observe("reset", self.backend.reset(user_id).await)?;
        info!(user_id, "Quota reset");
        Ok(snapshot)
    }

    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn seed(
        &self,
        user_id: Option<&str>,
        amount: Option<f64>,
    ) -> Result<QuotaSnapshot, Error> {
        let user_id = self.normalize_user_id(user_id);
        let remaining = normalize_seed_amount(amount, self.policy.default_remaining());
        let snapshot = self.observe("seed", self.backend.seed(user_id, remaining).await)?;
        info!(user_id, remaining, "Quota seeded");
        Ok(snapshot)
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.observe("health_check", self.backend.health_check().await)
    }

    fn observe<T>(&self, operation: &'static str, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_backend_unavailable() {
                self.metrics.record_backend_error(operation);
            }
        }
        result
    }
}
