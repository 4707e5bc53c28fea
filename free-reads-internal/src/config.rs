use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::quota::QuotaPolicy;

/// Environment variable holding the durable store URL. Unset or empty selects the local fallback.
pub const REDIS_URL_ENV_VAR: &str = "FREE_READS_REDIS_URL";

/// Longest accepted window (ten years). Redis rejects `PX` values whose absolute expiry overflows.
pub const MAX_WINDOW_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

/// Configuration for the free-view quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Quota units granted per window
    #[serde(default = "default_remaining")]
    pub default_remaining: u32,

    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Partition used for callers without a usable user id
    #[serde(default = "default_anonymous_user_id")]
    pub anonymous_user_id: String,

    /// Prefix of the durable key layout
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub redis: RedisQuotaConfig,

    #[serde(default)]
    pub local: LocalQuotaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisQuotaConfig {
    /// Bound on every Redis round-trip in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on establishing the connection at startup
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Refuse to start when Redis is configured but unreachable
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalQuotaConfig {
    /// Interval of the expired-record sweep, 0 disables it
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_remaining() -> u32 {
    2
}

fn default_window_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_anonymous_user_id() -> String {
    "anonymous".to_string()
}

fn default_key_prefix() -> String {
    "free".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    500
}

fn default_redis_connect_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_remaining: default_remaining(),
            window_ms: default_window_ms(),
            anonymous_user_id: default_anonymous_user_id(),
            key_prefix: default_key_prefix(),
            redis: RedisQuotaConfig::default(),
            local: LocalQuotaConfig::default(),
        }
    }
}

impl Default for RedisQuotaConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_redis_timeout_ms(),
            connect_timeout_ms: default_redis_connect_timeout_ms(),
            required: false,
        }
    }
}

impl Default for LocalQuotaConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl QuotaConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy::new(self.default_remaining, Duration::from_millis(self.window_ms))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.local.sweep_interval_ms > 0)
            .then(|| Duration::from_millis(self.local.sweep_interval_ms))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.window_ms == 0 {
            return Err(config_error("`quota.window_ms` must be greater than 0"));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("`quota.window_ms` must be at most {MAX_WINDOW_MS}"),
            }));
        }
        if self.redis.timeout_ms == 0 || self.redis.connect_timeout_ms == 0 {
            return Err(config_error("`quota.redis` timeouts must be greater than 0"));
        }
        if self.anonymous_user_id.trim().is_empty() {
            return Err(config_error("`quota.anonymous_user_id` must not be empty"));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(config_error("`quota.key_prefix` must not be empty"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.to_string(),
    })
}

impl Config {
    pub fn load_from_str(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        config.quota.validate()?;
        Ok(config)
    }

    pub async fn load_and_verify_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        Self::load_from_str(&contents)
    }
}
