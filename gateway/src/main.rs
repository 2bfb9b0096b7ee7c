use axum::Router;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use quota_engine::config::{Config, CounterStoreConfig, DurableStoreConfig};
use quota_engine::endpoints::status::QUOTA_ENGINE_VERSION;
use quota_engine::error;
use quota_engine::gateway_util::{self, AppStateData};
use quota_engine::observability::{self, LogFormat};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the quota config file at the specified path
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Log output format
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Logging first, so config errors below are reported through `tracing`
    let log_config = observability::setup_observability(args.log_format)
        .expect_pretty("Failed to initialize logging");

    tracing::info!("Starting quota gateway {QUOTA_ENGINE_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_from_path(Path::new(path))
                .await
                .ok() // `Error::new` already logged the cause
                .expect_pretty("Failed to load quota config"),
        )
    } else {
        tracing::warn!("No config file provided, so no plans are defined and every request without a plan is denied. Use `--config-file path/to/quota.toml` to specify a config file.");
        Arc::new(Config::default())
    };

    if config.gateway.debug {
        log_config
            .enable_debug()
            .expect_pretty("Failed to enable debug logs");
    }
    error::set_debug(config.gateway.debug).expect_pretty("Failed to set debug mode");

    let app_state = AppStateData::new(config.clone(), Some(metrics_handle))
        .await
        .expect_pretty("Failed to initialize gateway state");

    if config.reconciler.enabled {
        app_state.reconciler.start().await;
    } else {
        tracing::warn!("Usage reconciler is disabled; counters are only flushed through `POST /usage/admin/persist`");
    }

    let counter_store_pretty = match &config.quota.store {
        CounterStoreConfig::Memory => "memory".to_string(),
        CounterStoreConfig::Redis(redis) => format!("redis (url from `{}`)", redis.url_env),
    };
    let durable_store_pretty = match &config.durable {
        DurableStoreConfig::Memory => "memory".to_string(),
        DurableStoreConfig::ClickHouse(clickhouse) => {
            format!("clickhouse (database: {})", clickhouse.database)
        }
    };
    let upstream_pretty = match &config.gateway.upstream {
        Some(upstream) => upstream.url.to_string(),
        None => "none".to_string(),
    };

    let router = gateway_util::build_router(app_state.clone(), Router::new())
        // We log failed requests messages at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)));

    let bind_address = config.gateway.bind_address;
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Cannot listen on {bind_address}: {e}. Port {} is already taken; stop the other process or change `gateway.bind_address`.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Cannot listen on {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // Resolves port 0 to the port the OS picked
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to read the listener address");

    tracing::info!(
        "Quota gateway is listening on {actual_bind_address} with {} plan(s), counter store {counter_store_pretty}, durable store {durable_store_pretty}, and upstream {upstream_pretty}.",
        config.plans.len()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Gateway server exited with an error");

    // Persist whatever was counted since the last flush before exiting
    app_state.reconciler.stop().await;
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, shutting down");
        }
    };
}

/// `expect_pretty` is the only way main.rs is allowed to bail out during
/// initialization: it logs the message and exits with status 1. Everything
/// after startup handles errors gracefully.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
