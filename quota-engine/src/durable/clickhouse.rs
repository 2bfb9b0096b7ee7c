use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{PersistedCounter, UsageRepository};
use crate::config::ClickHouseConfig;
use crate::counter::UsageCounter;
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::period::PeriodKind;
use crate::principal::UserId;

const CLICKHOUSE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CLICKHOUSE_DATETIME64_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Usage counters in a ClickHouse `ReplacingMergeTree`, talked to over HTTP.
///
/// Rows are versioned by `updated_at`, so the latest write for a
/// `(principal_id, period_key)` wins; reads use `FINAL`. Upserts first read the
/// stored counts and skip counters that already match, which keeps repeated
/// flushes from any replica from touching unchanged rows.
pub struct ClickHouseUsageRepository {
    client: Client,
    url: Url,
    database: String,
    table: String,
    user: Option<String>,
    password: Option<SecretString>,
}

#[derive(Serialize)]
struct CounterRow<'a> {
    principal_id: u64,
    period_key: &'a str,
    period_kind: PeriodKind,
    count: u64,
    period_start: String,
    period_end: String,
    updated_at: String,
}

#[derive(Deserialize)]
struct StoredCounterRow {
    principal_id: u64,
    period_key: String,
    period_kind: PeriodKind,
    count: u64,
    period_start: i64,
    period_end: i64,
    updated_at_ms: i64,
}

impl StoredCounterRow {
    fn into_persisted(self) -> Result<PersistedCounter, Error> {
        let invalid = |field: &str| {
            Error::new(ErrorDetails::DurableStore {
                message: format!("ClickHouse returned an out-of-range `{field}`"),
            })
        };
        Ok(PersistedCounter {
            counter: UsageCounter {
                principal_id: UserId(self.principal_id),
                period_key: self.period_key,
                period_kind: self.period_kind,
                count: self.count,
                period_start: DateTime::from_timestamp(self.period_start, 0)
                    .ok_or_else(|| invalid("period_start"))?,
                period_end: DateTime::from_timestamp(self.period_end, 0)
                    .ok_or_else(|| invalid("period_end"))?,
            },
            updated_at: DateTime::from_timestamp_millis(self.updated_at_ms)
                .ok_or_else(|| invalid("updated_at"))?,
        })
    }
}

fn validate_identifier(kind: &str, name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorDetails::Config {
            message: format!("Invalid ClickHouse {kind} name `{name}`"),
        }))
    }
}

fn parse_rows(body: &str) -> Result<Vec<PersistedCounter>, Error> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<StoredCounterRow>(line)
                .map_err(|e| {
                    Error::new(ErrorDetails::Serialization {
                        message: format!("Failed to parse usage counter row from ClickHouse: {e}"),
                    })
                })?
                .into_persisted()
        })
        .collect()
}

#[derive(Deserialize)]
struct StoredCountRow {
    principal_id: u64,
    period_key: String,
    count: u64,
}

fn parse_counts(body: &str) -> Result<HashMap<(UserId, String), u64>, Error> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let row: StoredCountRow = serde_json::from_str(line).map_err(|e| {
                Error::new(ErrorDetails::Serialization {
                    message: format!("Failed to parse stored count from ClickHouse: {e}"),
                })
            })?;
            Ok(((UserId(row.principal_id), row.period_key), row.count))
        })
        .collect()
}

/// `Array(UInt64)` and `Array(String)` parameter values covering the batch's
/// keys. The `IN` filter is a superset; exact pairs are matched afterwards.
fn array_params(counters: &[UsageCounter]) -> (String, String) {
    let mut principal_ids: Vec<u64> = counters.iter().map(|c| c.principal_id.0).collect();
    principal_ids.sort_unstable();
    principal_ids.dedup();
    let mut period_keys: Vec<&str> = counters.iter().map(|c| c.period_key.as_str()).collect();
    period_keys.sort_unstable();
    period_keys.dedup();

    let ids = principal_ids
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let keys = period_keys
        .iter()
        .map(|key| format!("'{}'", key.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(",");
    (format!("[{ids}]"), format!("[{keys}]"))
}

fn changed_counters<'a>(
    counters: &'a [UsageCounter],
    stored: &HashMap<(UserId, String), u64>,
) -> Vec<&'a UsageCounter> {
    counters
        .iter()
        .filter(|counter| {
            stored.get(&(counter.principal_id, counter.period_key.clone())) != Some(&counter.count)
        })
        .collect()
}

impl ClickHouseUsageRepository {
    /// Build the repository and make sure the counter table exists.
    pub async fn new(config: &ClickHouseConfig, client: Client) -> Result<Self, Error> {
        validate_identifier("database", &config.database)?;
        validate_identifier("table", &config.table)?;
        let password = match &config.password_env {
            Some(var) => Some(SecretString::from(std::env::var(var).map_err(|_| {
                Error::new(ErrorDetails::Config {
                    message: format!("Environment variable `{var}` must hold the ClickHouse password"),
                })
            })?)),
            None => None,
        };
        let repository = Self {
            client,
            url: config.url.clone(),
            database: config.database.clone(),
            table: config.table.clone(),
            user: config.user.clone(),
            password,
        };
        repository.ensure_table().await?;
        Ok(repository)
    }

    async fn ensure_table(&self) -> Result<(), Error> {
        let query = format!(
            r#"CREATE TABLE IF NOT EXISTS {table}
            (
                principal_id UInt64,
                period_key String,
                period_kind LowCardinality(String),
                count UInt64,
                period_start DateTime('UTC'),
                period_end DateTime('UTC'),
                updated_at DateTime64(3, 'UTC')
            )
            ENGINE = ReplacingMergeTree(updated_at)
            ORDER BY (principal_id, period_key)"#,
            table = self.table
        );
        self.run_query(query, &[]).await?;
        Ok(())
    }

    /// A POST against the HTTP interface with credentials attached.
    fn request(&self, url_params: &[(String, String)], body: String) -> RequestBuilder {
        let request = self
            .client
            .post(self.url.clone())
            .query(&[("database", self.database.as_str())])
            .query(url_params)
            .body(body);
        match &self.user {
            Some(user) => request.basic_auth(
                user,
                self.password.as_ref().map(|p| p.expose_secret().to_string()),
            ),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder, action: &str) -> Result<String, Error> {
        let response = request.send().await.map_err(|e| {
            Error::new(ErrorDetails::DurableStore {
                message: format!("ClickHouse {action} failed: {}", DisplayOrDebugGateway::new(e)),
            })
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::new(ErrorDetails::DurableStore {
                message: format!(
                    "Failed to read ClickHouse {action} response: {}",
                    DisplayOrDebugGateway::new(e)
                ),
            })
        })?;
        if !status.is_success() {
            return Err(Error::new(ErrorDetails::DurableStore {
                message: format!("ClickHouse {action} returned {status}: {}", body.trim()),
            }));
        }
        Ok(body)
    }

    /// POST `query` as the request body. `params` become ClickHouse query
    /// parameters (`{name:Type}` placeholders).
    async fn run_query(&self, query: String, params: &[(&str, String)]) -> Result<String, Error> {
        let mut url_params = vec![(
            "output_format_json_quote_64bit_integers".to_string(),
            "0".to_string(),
        )];
        url_params.extend(
            params
                .iter()
                .map(|(name, value)| (format!("param_{name}"), value.clone())),
        );
        self.execute(self.request(&url_params, query), "query").await
    }

    async fn write(&self, rows: String) -> Result<(), Error> {
        let insert = format!("INSERT INTO {} FORMAT JSONEachRow", self.table);
        self.execute(self.request(&[("query".to_string(), insert)], rows), "insert")
            .await?;
        Ok(())
    }

    /// Stored counts for the given counters' keys.
    async fn stored_counts(
        &self,
        counters: &[UsageCounter],
    ) -> Result<HashMap<(UserId, String), u64>, Error> {
        let query = format!(
            "SELECT principal_id, period_key, count FROM {} FINAL \
             WHERE principal_id IN {{principal_ids:Array(UInt64)}} \
             AND period_key IN {{period_keys:Array(String)}} FORMAT JSONEachRow",
            self.table
        );
        let (principal_ids, period_keys) = array_params(counters);
        let body = self
            .run_query(
                query,
                &[("principal_ids", principal_ids), ("period_keys", period_keys)],
            )
            .await?;
        parse_counts(&body)
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT principal_id, period_key, period_kind, count, \
             toUnixTimestamp(period_start) AS period_start, \
             toUnixTimestamp(period_end) AS period_end, \
             toUnixTimestamp64Milli(updated_at) AS updated_at_ms \
             FROM {} FINAL",
            self.table
        )
    }
}

#[async_trait]
impl UsageRepository for ClickHouseUsageRepository {
    async fn upsert_counters(&self, counters: &[UsageCounter]) -> Result<(), Error> {
        if counters.is_empty() {
            return Ok(());
        }
        // Rows are versioned by `updated_at`, so rewriting an equal count would
        // still replace the stored row.
        let stored = self.stored_counts(counters).await?;
        let changed = changed_counters(counters, &stored);
        if changed.is_empty() {
            return Ok(());
        }
        let updated_at = Utc::now().format(CLICKHOUSE_DATETIME64_FORMAT).to_string();
        let mut rows = String::new();
        for counter in changed {
            let row = CounterRow {
                principal_id: counter.principal_id.0,
                period_key: &counter.period_key,
                period_kind: counter.period_kind,
                count: counter.count,
                period_start: counter
                    .period_start
                    .format(CLICKHOUSE_DATETIME_FORMAT)
                    .to_string(),
                period_end: counter.period_end.format(CLICKHOUSE_DATETIME_FORMAT).to_string(),
                updated_at: updated_at.clone(),
            };
            let line = serde_json::to_string(&row).map_err(|e| {
                Error::new(ErrorDetails::Serialization {
                    message: format!("Failed to serialize usage counter: {e}"),
                })
            })?;
            rows.push_str(&line);
            rows.push('\n');
        }
        self.write(rows).await
    }

    async fn get_counter(
        &self,
        principal_id: UserId,
        period_key: &str,
    ) -> Result<Option<PersistedCounter>, Error> {
        let query = format!(
            "{} WHERE principal_id = {{principal_id:UInt64}} AND period_key = {{period_key:String}} \
             LIMIT 1 FORMAT JSONEachRow",
            self.select_columns()
        );
        let body = self
            .run_query(
                query,
                &[
                    ("principal_id", principal_id.to_string()),
                    ("period_key", period_key.to_string()),
                ],
            )
            .await?;
        Ok(parse_rows(&body)?.into_iter().next())
    }

    async fn history(
        &self,
        principal_id: UserId,
        limit: usize,
    ) -> Result<Vec<PersistedCounter>, Error> {
        let query = format!(
            "{} WHERE principal_id = {{principal_id:UInt64}} \
             ORDER BY period_start DESC LIMIT {{limit:UInt64}} FORMAT JSONEachRow",
            self.select_columns()
        );
        let body = self
            .run_query(
                query,
                &[
                    ("principal_id", principal_id.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        parse_rows(&body)
    }

    async fn health(&self) -> Result<(), Error> {
        self.run_query("SELECT 1".to_string(), &[]).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "clickhouse"
    }
}
