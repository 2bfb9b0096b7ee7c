use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;

use crate::config::{Config, CounterStoreConfig, DurableStoreConfig, QuotaConfig};
use crate::counter::{CounterStore, MemoryCounterStore, RedisCounterStore};
use crate::durable::{ClickHouseUsageRepository, MemoryUsageRepository, UsageRepository};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::plan::PlanStore;
use crate::principal::{require_principal, Auth};
use crate::quota::{quota_middleware, EnforcementSettings, QuotaEnforcer, QuotaMiddlewareState};
use crate::reconciler::UsageReconciler;

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub auth: Auth,
    pub enforcer: Arc<QuotaEnforcer>,
    pub reconciler: UsageReconciler,
    pub metrics_handle: Option<PrometheusHandle>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(
        config: Arc<Config>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Self, Error> {
        let auth = Auth::from_config(&config.auth)?;
        Self::new_with_auth(config, auth, metrics_handle).await
    }

    pub async fn new_with_auth(
        config: Arc<Config>,
        auth: Auth,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Self, Error> {
        let counter_store = setup_counter_store(&config.quota).await?;
        let http_client = setup_http_client()?;
        let repository = setup_usage_repository(&config.durable, http_client.clone()).await?;

        let plans = PlanStore::new(config.quota.no_plan);
        plans.load_plans(config.plans.iter().cloned());
        let enforcer = Arc::new(QuotaEnforcer::new(
            Arc::clone(&counter_store),
            plans,
            EnforcementSettings::from_config(&config.quota)?,
        ));
        let reconciler = UsageReconciler::new(counter_store, repository, config.reconciler.clone());

        Ok(Self {
            config,
            http_client,
            auth,
            enforcer,
            reconciler,
            metrics_handle,
        })
    }

    pub fn quota_middleware_state(&self) -> QuotaMiddlewareState {
        QuotaMiddlewareState {
            auth: self.auth.clone(),
            enforcer: Arc::clone(&self.enforcer),
            exempt_paths: Arc::from(self.config.gateway.exempt_paths.clone()),
        }
    }
}

pub async fn setup_counter_store(config: &QuotaConfig) -> Result<Arc<dyn CounterStore>, Error> {
    match &config.store {
        CounterStoreConfig::Memory => {
            tracing::info!("Using the in-memory counter store; counts are per process");
            Ok(Arc::new(MemoryCounterStore::with_retention_days(
                config.counter_retention_days,
            )))
        }
        CounterStoreConfig::Redis(redis_config) => {
            let url = std::env::var(&redis_config.url_env).map_err(|_| {
                Error::new(ErrorDetails::Config {
                    message: format!(
                        "Environment variable `{}` must hold the Redis URL",
                        redis_config.url_env
                    ),
                })
            })?;
            let store =
                RedisCounterStore::connect(&url, redis_config, config.counter_retention_days)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn setup_usage_repository(
    config: &DurableStoreConfig,
    http_client: Client,
) -> Result<Arc<dyn UsageRepository>, Error> {
    match config {
        DurableStoreConfig::Memory => {
            tracing::warn!("Using the in-memory durable store; flushed usage is lost on restart");
            Ok(Arc::new(MemoryUsageRepository::new()))
        }
        DurableStoreConfig::ClickHouse(clickhouse_config) => {
            let repository = ClickHouseUsageRepository::new(clickhouse_config, http_client).await?;
            tracing::info!(
                database = %clickhouse_config.database,
                table = %clickhouse_config.table,
                "Connected to ClickHouse durable store"
            );
            Ok(Arc::new(repository))
        }
    }
}

fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// Assemble the gateway router.
///
/// `/api/*` (forwarded upstream) and any `extra_metered_routes` go through quota
/// enforcement. The `/usage` endpoints only require authentication; `/health`
/// and `/metrics` are open.
pub fn build_router(app_state: AppStateData, extra_metered_routes: Router<AppStateData>) -> Router {
    let metered_routes = Router::new()
        .route("/api/{*rest}", any(endpoints::proxy::upstream_proxy_handler))
        .merge(extra_metered_routes)
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.quota_middleware_state(),
            quota_middleware,
        ));

    let usage_routes = Router::new()
        .route(
            "/usage/current",
            get(endpoints::usage::current_usage_handler),
        )
        .route(
            "/usage/history",
            get(endpoints::usage::usage_history_handler),
        )
        .route(
            "/usage/admin/reset/{user_id}",
            post(endpoints::usage::reset_usage_handler),
        )
        .route(
            "/usage/admin/persist",
            post(endpoints::usage::persist_usage_handler),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.auth.clone(),
            require_principal,
        ));

    let public_routes = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route("/metrics", get(endpoints::status::metrics_handler));

    Router::new()
        .merge(metered_routes)
        .merge(usage_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state)
}
