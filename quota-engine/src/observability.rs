//! Log and metrics setup for the gateway binary.
//!
//! Logs go through `tracing-subscriber` with an `EnvFilter` (overridable with
//! `RUST_LOG`). The filter sits behind a reload layer so `gateway.debug` in the
//! config file can turn on debug logs after the config has been parsed.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "gateway=info,quota_engine=info,warn";
const DEBUG_LOG_FILTER: &str = "gateway=debug,quota_engine=debug,tower_http=debug,warn";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Handle returned by [`setup_observability`] for adjusting logging once the
/// config file is known.
pub struct LogConfigHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

impl LogConfigHandle {
    /// Switch to debug logs. `RUST_LOG`, when set, still takes precedence.
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.env_override {
            return Ok(());
        }
        self.filter
            .reload(EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

pub fn setup_observability(log_format: LogFormat) -> Result<LogConfigHandle, Error> {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);

    let result = match log_format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to initialize tracing subscriber: {e}"),
        })
    })?;

    Ok(LogConfigHandle {
        filter: handle,
        env_override,
    })
}

/// Install the global Prometheus recorder. Rendered on `GET /metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "quota_requests_total",
        "Quota decisions, labelled by `decision`"
    );
    metrics::describe_counter!(
        "quota_store_errors_total",
        "Counter store operations that failed or timed out"
    );
    metrics::describe_counter!(
        "quota_reconcile_flushed_total",
        "Counters written to the durable store"
    );
    metrics::describe_counter!(
        "quota_reconcile_failures_total",
        "Reconciler flushes that failed after all retries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::default().to_string(), "pretty");
        assert_eq!(LogFormat::Json.to_string(), "json");
        assert_eq!(
            <LogFormat as clap::ValueEnum>::from_str("json", false).unwrap(),
            LogFormat::Json
        );
    }

    #[test]
    fn test_log_filters_parse() {
        assert!(EnvFilter::from_str(DEFAULT_LOG_FILTER).is_ok());
        assert!(EnvFilter::from_str(DEBUG_LOG_FILTER).is_ok());
    }
}
