//! Logging and metrics setup for the gateway.
//!
//! Logs go through `tracing` with an `EnvFilter` installed behind a reload handle, so that
//! `gateway.debug` in the config file can raise verbosity once the config has been read.
//! Metrics are exported in Prometheus text format from `/metrics`.

use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "warn,free_reads_internal=info,gateway=info";
const DEBUG_LOG_FILTER: &str = "warn,free_reads_internal=debug,gateway=debug,tower_http=debug";

#[derive(Clone, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Log settings that can only be applied after the config file is loaded
pub struct DelayedLogConfig {
    pub delayed_debug_logs: DelayedDebugLogs,
}

pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    // `RUST_LOG` always wins over `gateway.debug`
    env_filter_overridden: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.env_filter_overridden {
            tracing::info!("`RUST_LOG` is set, ignoring `gateway.debug`");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Install the global `tracing` subscriber. Must be called once, before any other logging.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedLogConfig, Error> {
    let (env_filter, env_filter_overridden) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    };
    let (filter, handle) = reload::Layer::new(env_filter);

    let json_layer = matches!(log_format, LogFormat::Json).then(|| fmt::layer().json());
    let pretty_layer = matches!(log_format, LogFormat::Pretty).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    Ok(DelayedLogConfig {
        delayed_debug_logs: DelayedDebugLogs {
            handle,
            env_filter_overridden,
        },
    })
}

/// Install the global Prometheus recorder used by the `metrics` macros
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;

    metrics::describe_counter!(
        "free_reads_consume_total",
        "Consume calls by outcome (charged, repeat, denied)"
    );
    metrics::describe_counter!(
        "free_reads_backend_errors_total",
        "Quota backend failures by operation"
    );

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert!(matches!(
            LogFormat::from_str("json", true).unwrap(),
            LogFormat::Json
        ));
        assert!(matches!(
            LogFormat::from_str("pretty", true).unwrap(),
            LogFormat::Pretty
        ));
        assert!(LogFormat::from_str("xml", true).is_err());
        assert_eq!(LogFormat::default().to_string(), "pretty");
    }

    #[test]
    fn test_filters_parse() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        assert!(EnvFilter::try_new(DEBUG_LOG_FILTER).is_ok());
    }
}
