use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::{Client, RedisError, Script};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::QuotaConfig;
use crate::error::{Error, ErrorDetails};
use crate::quota::{
    BackendKind, Clock, DenyReason, QuotaBackend, QuotaDecision, QuotaPolicy, QuotaSnapshot,
};

// KEYS: remaining, seen. ARGV: doc id, window ms, default remaining.
// A counter that is missing, negative or not a number starts a new window and drops any
// consumed set left behind from the previous one.
const CONSUME_SCRIPT: &str = r"
local rem = tonumber(redis.call('GET', KEYS[1]))
if rem == nil or rem < 0 then
  rem = tonumber(ARGV[3])
  redis.call('DEL', KEYS[2])
  redis.call('SET', KEYS[1], rem, 'PX', ARGV[2])
end
rem = math.floor(rem)
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
  return {1, rem, 0, redis.call('SMEMBERS', KEYS[2])}
end
if rem > 0 then
  rem = rem - 1
  redis.call('SET', KEYS[1], rem, 'PX', ARGV[2])
  redis.call('SADD', KEYS[2], ARGV[1])
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
  return {1, rem, 1, redis.call('SMEMBERS', KEYS[2])}
end
return {0, rem, 0, {}}
";

// KEYS: remaining, seen. ARGV: window ms, default remaining.
// Returns {remaining, pttl of the counter, members}. A live record keeps its expiration.
const INSPECT_SCRIPT: &str = r"
local rem = tonumber(redis.call('GET', KEYS[1]))
if rem == nil or rem < 0 then
  rem = tonumber(ARGV[2])
  redis.call('DEL', KEYS[2])
  redis.call('SET', KEYS[1], rem, 'PX', ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {math.floor(rem), ttl, redis.call('SMEMBERS', KEYS[2])}
";

// KEYS: remaining, seen. ARGV: remaining, window ms.
const SEED_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return redis.call('SMEMBERS', KEYS[2])
";

/// Durable quota store shared by every gateway instance pointing at the same Redis.
///
/// Each user occupies two keys, `{prefix}:{user}:remaining` (integer counter) and
/// `{prefix}:{user}:seen` (set of consumed document ids), both carrying the window as TTL.
/// Read-modify-write operations run as Lua scripts so the server executes them atomically.
///
/// Every operation opens its own connection from the client, so a dropped socket or a Redis
/// restart only fails the calls that were in flight.
pub struct RedisQuotaStore {
    client: Client,
    policy: QuotaPolicy,
    key_prefix: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    consume_script: Script,
    inspect_script: Script,
    seed_script: Script,
}

/// Key pair for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaKeys {
    pub remaining: String,
    pub seen: String,
}

impl QuotaKeys {
    pub fn new(prefix: &str, user_id: &str) -> Self {
        Self {
            remaining: format!("{prefix}:{user_id}:remaining"),
            seen: format!("{prefix}:{user_id}:seen"),
        }
    }
}

impl RedisQuotaStore {
    /// Connect to Redis, failing if the connection is not established within
    /// `quota.redis.connect_timeout_ms`
    pub async fn connect(
        url: &SecretString,
        config: &QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let client = Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid Redis URL: {e}"),
            })
        })?;

        let connect_timeout = Duration::from_millis(config.redis.connect_timeout_ms);
        let mut connection = match timeout(
            connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(Error::new(ErrorDetails::BackendUnavailable {
                    operation: "connect".to_string(),
                    message: e.to_string(),
                }))
            }
            Err(_) => {
                return Err(Error::new(ErrorDetails::BackendUnavailable {
                    operation: "connect".to_string(),
                    message: format!("timed out after {}ms", connect_timeout.as_millis()),
                }))
            }
        };

        let store = Self::with_client(client, config, clock);
        let _: String = store
            .run(
                "connect",
                redis::cmd("PING").query_async::<String>(&mut connection),
            )
            .await?;
        info!(key_prefix = %store.key_prefix, "Connected to Redis quota store");
        Ok(store)
    }

    fn with_client(client: Client, config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            policy: config.policy(),
            key_prefix: config.key_prefix.clone(),
            timeout: Duration::from_millis(config.redis.timeout_ms),
            clock,
            consume_script: Script::new(CONSUME_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
            seed_script: Script::new(SEED_SCRIPT),
        }
    }

    fn keys(&self, user_id: &str) -> QuotaKeys {
        QuotaKeys::new(&self.key_prefix, user_id)
    }

    /// Run one Redis call, including opening its connection, under the configured timeout
    async fn run<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, Error> {
        match timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::BackendUnavailable {
                operation: operation.to_string(),
                message: e.to_string(),
            })),
            Err(_) => Err(Error::new(ErrorDetails::BackendUnavailable {
                operation: operation.to_string(),
                message: format!("timed out after {}ms", self.timeout.as_millis()),
            })),
        }
    }

    fn snapshot_from_touch(&self, remaining: i64, consumed: Vec<String>) -> QuotaSnapshot {
        QuotaSnapshot {
            remaining: clamp_remaining(remaining),
            consumed: sorted(consumed),
            expires_at: self.policy.expires_from(self.clock.now()),
        }
    }
}

/// Interpret the consume script's `{ok, remaining, charged, members}` reply
fn decision_from_reply(
    reply: (i64, i64, i64, Vec<String>),
    expires_at: DateTime<Utc>,
) -> QuotaDecision {
    let (ok, remaining, charged, consumed) = reply;
    if ok == 0 {
        return QuotaDecision::Deny {
            reason: DenyReason::Limit,
        };
    }
    QuotaDecision::Allow {
        snapshot: QuotaSnapshot {
            remaining: clamp_remaining(remaining),
            consumed: sorted(consumed),
            expires_at,
        },
        charged: charged == 1,
    }
}

/// Interpret the inspect script's `{remaining, pttl, members}` reply
fn snapshot_from_inspect_reply(
    reply: (i64, i64, Vec<String>),
    now: DateTime<Utc>,
) -> QuotaSnapshot {
    let (remaining, ttl_ms, consumed) = reply;
    let expires_at = now
        .checked_add_signed(TimeDelta::milliseconds(ttl_ms.max(0)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    QuotaSnapshot {
        remaining: clamp_remaining(remaining),
        consumed: sorted(consumed),
        expires_at,
    }
}

fn clamp_remaining(remaining: i64) -> u32 {
    u32::try_from(remaining.max(0)).unwrap_or(u32::MAX)
}

fn sorted(mut members: Vec<String>) -> Vec<String> {
    members.sort_unstable();
    members
}

#[async_trait]
impl QuotaBackend for RedisQuotaStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn inspect(&self, user_id: &str) -> Result<QuotaSnapshot, Error> {
        let keys = self.keys(user_id);
        let reply: (i64, i64, Vec<String>) = self
            .run("inspect", async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                self.inspect_script
                    .key(&keys.remaining)
                    .key(&keys.seen)
                    .arg(self.policy.window_ms())
                    .arg(self.policy.default_remaining())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(snapshot_from_inspect_reply(reply, self.clock.now()))
    }

    async fn consume(&self, user_id: &str, doc_id: &str) -> Result<QuotaDecision, Error> {
        let keys = self.keys(user_id);
        let reply: (i64, i64, i64, Vec<String>) = self
            .run("consume", async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                self.consume_script
                    .key(&keys.remaining)
                    .key(&keys.seen)
                    .arg(doc_id)
                    .arg(self.policy.window_ms())
                    .arg(self.policy.default_remaining())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        debug!(user_id, doc_id, ok = reply.0, remaining = reply.1, "Redis consume");
        Ok(decision_from_reply(
            reply,
            self.policy.expires_from(self.clock.now()),
        ))
    }

    async fn reset(&self, user_id: &str) -> Result<QuotaSnapshot, Error> {
        let keys = self.keys(user_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&keys.remaining)
            .arg(self.policy.default_remaining())
            .arg("PX")
            .arg(self.policy.window_ms())
            .ignore()
            .del(&keys.seen)
            .ignore();
        self.run("reset", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            pipe.query_async::<()>(&mut conn).await
        })
        .await?;
        Ok(self.snapshot_from_touch(i64::from(self.policy.default_remaining()), Vec::new()))
    }

    async fn seed(&self, user_id: &str, remaining: u32) -> Result<QuotaSnapshot, Error> {
        let keys = self.keys(user_id);
        let consumed: Vec<String> = self
            .run("seed", async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                self.seed_script
                    .key(&keys.remaining)
                    .key(&keys.seen)
                    .arg(remaining)
                    .arg(self.policy.window_ms())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(self.snapshot_from_touch(i64::from(remaining), consumed))
    }

    async fn health_check(&self) -> Result<(), Error> {
        let _: String = self
            .run("health_check", async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("PING").query_async::<String>(&mut conn).await
            })
            .await?;
        Ok(())
    }
}
