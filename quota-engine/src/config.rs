use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::plan::{NoPlanPolicy, Plan};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub durable: DurableStoreConfig,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    /// Path prefixes that skip quota enforcement entirely
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    /// Application server that metered `/api/*` requests are forwarded to
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            exempt_paths: default_exempt_paths(),
            debug: false,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub url: Url,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_upstream_timeout_ms() -> u64 {
    120_000
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Name of the environment variable holding the HS256 signing secret
    #[serde(default = "default_jwt_secret_env")]
    pub jwt_secret_env: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_env: default_jwt_secret_env(),
            issuer: None,
        }
    }
}

fn default_jwt_secret_env() -> String {
    "QUOTA_JWT_SECRET".to_string()
}

/// Behaviour when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request without counting it and log a warning
    FailOpen,
    /// Deny with `503 Service Unavailable`
    FailClosed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default)]
    pub store: CounterStoreConfig,
    pub store_failure: StoreFailurePolicy,
    pub no_plan: NoPlanPolicy,
    pub quota_exceeded_status: u16,
    pub plan_restricted_status: u16,
    pub store_unavailable_retry_after_secs: u64,
    /// How long a counter outlives the end of its period
    #[serde(default = "default_retention_days")]
    pub counter_retention_days: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            store: CounterStoreConfig::default(),
            store_failure: StoreFailurePolicy::FailOpen,
            no_plan: NoPlanPolicy::Deny,
            quota_exceeded_status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            plan_restricted_status: StatusCode::FORBIDDEN.as_u16(),
            store_unavailable_retry_after_secs: 30,
            counter_retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterStoreConfig {
    #[default]
    Memory,
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStoreConfig {
    /// Name of the environment variable holding the Redis URL
    #[serde(default = "default_redis_url_env")]
    pub url_env: String,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
    /// Safety TTL on in-flight counters so a crashed process cannot leak slots
    #[serde(default = "default_slot_ttl_secs")]
    pub slot_ttl_secs: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url_env: default_redis_url_env(),
            timeout_ms: default_redis_timeout_ms(),
            slot_ttl_secs: default_slot_ttl_secs(),
        }
    }
}

fn default_redis_url_env() -> String {
    "QUOTA_REDIS_URL".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    250
}

fn default_slot_ttl_secs() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    90
}

impl RedisStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_retries() -> usize {
    5
}

fn default_min_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DurableStoreConfig {
    #[default]
    Memory,
    #[serde(rename = "clickhouse")]
    ClickHouse(ClickHouseConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseConfig {
    pub url: Url,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default = "default_clickhouse_table")]
    pub table: String,
    #[serde(default)]
    pub user: Option<String>,
    /// Name of the environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_clickhouse_table() -> String {
    "UsageCounter".to_string()
}

impl Config {
    pub async fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        Self::load_from_toml(&contents)
    }

    pub fn load_from_toml(contents: &str) -> Result<Self, Error> {
        let deserializer = toml::Deserializer::new(contents);
        let config: Config = serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let config_error = |message: String| Error::new(ErrorDetails::Config { message });

        for (field, status) in [
            ("quota.quota_exceeded_status", self.quota.quota_exceeded_status),
            ("quota.plan_restricted_status", self.quota.plan_restricted_status),
        ] {
            match StatusCode::from_u16(status) {
                Ok(code) if code.is_client_error() || code.is_server_error() => {}
                _ => {
                    return Err(config_error(format!(
                        "`{field}` must be a 4xx or 5xx status code, got {status}"
                    )))
                }
            }
        }

        let mut seen = HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id) {
                return Err(config_error(format!("Plan id {} is defined twice", plan.id)));
            }
            if plan.concurrency_limit == 0 {
                return Err(config_error(format!(
                    "Plan {} must allow at least one concurrent request",
                    plan.id
                )));
            }
        }

        if let NoPlanPolicy::DefaultPlan(default_id) = self.quota.no_plan {
            if !seen.contains(&default_id) {
                return Err(config_error(format!(
                    "`quota.no_plan` names default plan {default_id}, which is not defined in [[plans]]"
                )));
            }
        }

        if self.reconciler.interval_secs == 0 {
            return Err(config_error(
                "`reconciler.interval_secs` must be greater than zero".to_string(),
            ));
        }
        if self.reconciler.min_backoff_ms > self.reconciler.max_backoff_ms {
            return Err(config_error(
                "`reconciler.min_backoff_ms` must not exceed `reconciler.max_backoff_ms`"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
