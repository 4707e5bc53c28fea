use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::quota::{DenyReason, QuotaDecision, QuotaPolicy, QuotaSnapshot};

/// One user's quota record as held by the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub remaining: u32,
    pub consumed: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaState {
    pub fn fresh(policy: &QuotaPolicy, now: DateTime<Utc>) -> Self {
        Self {
            remaining: policy.default_remaining(),
            consumed: BTreeSet::new(),
            expires_at: policy.expires_from(now),
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Replace a lapsed record with a default one. Returns true if it did.
    pub fn renew_if_expired(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            *self = Self::fresh(policy, now);
            true
        } else {
            false
        }
    }

    fn touch(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) {
        self.expires_at = policy.expires_from(now);
        self.updated_at = now;
    }

    /// Decide and apply one view of `doc_id`. A denial leaves the record untouched.
    pub fn apply_consume(
        &mut self,
        doc_id: &str,
        policy: &QuotaPolicy,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        if self.consumed.contains(doc_id) {
            self.touch(policy, now);
            return QuotaDecision::Allow {
                snapshot: self.snapshot(),
                charged: false,
            };
        }
        if self.remaining == 0 {
            return QuotaDecision::Deny {
                reason: DenyReason::Limit,
            };
        }
        self.remaining -= 1;
        self.consumed.insert(doc_id.to_string());
        self.touch(policy, now);
        QuotaDecision::Allow {
            snapshot: self.snapshot(),
            charged: true,
        }
    }

    pub fn reset(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) {
        *self = Self::fresh(policy, now);
    }

    pub fn seed(&mut self, remaining: u32, policy: &QuotaPolicy, now: DateTime<Utc>) {
        self.remaining = remaining;
        self.touch(policy, now);
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            remaining: self.remaining,
            consumed: self.consumed.iter().cloned().collect(),
            expires_at: self.expires_at,
        }
    }
}
