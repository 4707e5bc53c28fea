#![cfg(test)]

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, ErrorDetails};
use crate::quota::{BackendKind, Clock, QuotaBackend, QuotaDecision, QuotaSnapshot};

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_at_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap())
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Backend whose every call fails the way an unreachable Redis does
pub struct UnavailableBackend;

#[async_trait]
impl QuotaBackend for UnavailableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn inspect(&self, _user_id: &str) -> Result<QuotaSnapshot, Error> {
        Err(unavailable("inspect"))
    }

    async fn consume(&self, _user_id: &str, _doc_id: &str) -> Result<QuotaDecision, Error> {
        Err(unavailable("consume"))
    }

    async fn reset(&self, _user_id: &str) -> Result<QuotaSnapshot, Error> {
        Err(unavailable("reset"))
    }

    async fn seed(&self, _user_id: &str, _remaining: u32) -> Result<QuotaSnapshot, Error> {
        Err(unavailable("seed"))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Err(unavailable("health_check"))
    }
}

fn unavailable(operation: &str) -> Error {
    Error::new(ErrorDetails::BackendUnavailable {
        operation: operation.to_string(),
        message: "connection refused".to_string(),
    })
}
