use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::error::Error;
use crate::quota::{
    BackendKind, Clock, QuotaBackend, QuotaDecision, QuotaPolicy, QuotaSnapshot, QuotaState,
};

/// Process-local quota store.
///
/// Records live only as long as the process and are not shared between instances.
/// Every operation runs while holding the user's map entry, so concurrent calls for one
/// user are serialized while other users (on other shards) proceed in parallel.
pub struct LocalQuotaStore {
    records: Arc<DashMap<String, QuotaState>>,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
    sweep_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl LocalQuotaStore {
    pub fn new(policy: QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            policy,
            clock,
            sweep_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Run `f` on the user's live record, creating or renewing it first
    fn with_live_record<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut QuotaState, DateTime<Utc>) -> T,
    ) -> T {
        let now = self.clock.now();
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaState::fresh(&self.policy, now));
        if record.renew_if_expired(&self.policy, now) {
            debug!(user_id, "Local quota record lapsed, starting a new window");
        }
        f(record.value_mut(), now)
    }

    /// Number of records currently held, live or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every lapsed record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        purge_expired_records(&self.records, self.clock.now())
    }

    /// Start a background task purging lapsed records every `every`
    pub async fn start_sweeper(&self, every: Duration) {
        let records = Arc::downgrade(&self.records);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(every);
            sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            sweep_interval.tick().await;

            loop {
                sweep_interval.tick().await;
                let Some(records) = records.upgrade() else {
                    break;
                };
                let removed = purge_expired_records(&records, clock.now());
                if removed > 0 {
                    debug!(removed, "Purged expired local quota records");
                }
            }
        });

        if let Some(previous) = self.sweep_handle.write().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}

fn purge_expired_records(records: &DashMap<String, QuotaState>, now: DateTime<Utc>) -> usize {
    let before = records.len();
    records.retain(|_, state| !state.is_expired(now));
    before.saturating_sub(records.len())
}

#[async_trait]
impl QuotaBackend for LocalQuotaStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn inspect(&self, user_id: &str) -> Result<QuotaSnapshot, Error> {
        Ok(self.with_live_record(user_id, |record, _| record.snapshot()))
    }

    async fn consume(&self, user_id: &str, doc_id: &str) -> Result<QuotaDecision, Error> {
        let policy = self.policy;
        Ok(self.with_live_record(user_id, |record, now| {
            record.apply_consume(doc_id, &policy, now)
        }))
    }

    async fn reset(&self, user_id: &str) -> Result<QuotaSnapshot, Error> {
        let policy = self.policy;
        Ok(self.with_live_record(user_id, |record, now| {
            record.reset(&policy, now);
            record.snapshot()
        }))
    }

    async fn seed(&self, user_id: &str, remaining: u32) -> Result<QuotaSnapshot, Error> {
        let policy = self.policy;
        Ok(self.with_live_record(user_id, |record, now| {
            record.seed(remaining, &policy, now);
            record.snapshot()
        }))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
