use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{CounterStore, UsageCounter};
use crate::config::RedisStoreConfig;
use crate::error::{Error, ErrorDetails};
use crate::period::{Period, PeriodKind};
use crate::principal::UserId;

const COUNTER_KEY_PREFIX: &str = "usage_counter:";
const IN_FLIGHT_KEY_PREFIX: &str = "quota_inflight:";
const SCAN_BATCH: usize = 500;
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Creates the counter hash on first touch, adds `ARGV[5]` to its count and
/// returns the new count. Expiry is only set once, when the hash has none.
const TOUCH_COUNTER_LUA: &str = r#"
redis.call('HSETNX', KEYS[1], 'period_kind', ARGV[1])
redis.call('HSETNX', KEYS[1], 'period_start', ARGV[2])
redis.call('HSETNX', KEYS[1], 'period_end', ARGV[3])
local count = redis.call('HINCRBY', KEYS[1], 'count', ARGV[5])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIREAT', KEYS[1], ARGV[4])
end
return count
"#;

const RESET_COUNTER_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('HSET', KEYS[1], 'count', 0)
    return 1
end
return 0
"#;

const ACQUIRE_SLOT_LUA: &str = r#"
local in_flight = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return in_flight
"#;

const RELEASE_SLOT_LUA: &str = r#"
local in_flight = redis.call('DECR', KEYS[1])
if in_flight <= 0 then
    redis.call('DEL', KEYS[1])
    return 0
end
return in_flight
"#;

fn counter_key(principal_id: UserId, period_key: &str) -> String {
    format!("{COUNTER_KEY_PREFIX}{principal_id}:{period_key}")
}

fn in_flight_key(principal_id: UserId) -> String {
    format!("{IN_FLIGHT_KEY_PREFIX}{principal_id}")
}

fn store_unavailable(message: String) -> Error {
    Error::new(ErrorDetails::StoreUnavailable { message })
}

/// Counter store shared across gateway replicas through Redis.
///
/// Each counter is a hash at `usage_counter:{principal}:{period_key}`; every
/// mutation is a Lua script so the increment and its expiry land atomically.
/// All calls are bounded by the configured timeout.
pub struct RedisCounterStore {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    timeout: Duration,
    slot_ttl_secs: u64,
    retention: chrono::Duration,
    touch_counter_script: Script,
    reset_counter_script: Script,
    acquire_slot_script: Script,
    release_slot_script: Script,
}

impl RedisCounterStore {
    /// Build the store. An unreachable server at startup is logged, not fatal:
    /// the first call after Redis comes back reconnects.
    pub async fn connect(
        url: &str,
        config: &RedisStoreConfig,
        retention_days: u32,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let store = Self {
            client,
            conn: RwLock::new(None),
            timeout: config.timeout(),
            slot_ttl_secs: config.slot_ttl_secs,
            retention: chrono::Duration::days(i64::from(retention_days)),
            touch_counter_script: Script::new(TOUCH_COUNTER_LUA),
            reset_counter_script: Script::new(RESET_COUNTER_LUA),
            acquire_slot_script: Script::new(ACQUIRE_SLOT_LUA),
            release_slot_script: Script::new(RELEASE_SLOT_LUA),
        };
        match store.connection().await {
            Ok(_) => info!("Connected to Redis counter store"),
            Err(e) => warn!("Starting without a Redis connection: {e}"),
        }
        Ok(store)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let connect_timeout = self.timeout.max(MIN_CONNECT_TIMEOUT);
        let conn = match timeout(connect_timeout, self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(store_unavailable(format!("Failed to connect: {e}"))),
            Err(_) => {
                return Err(store_unavailable(format!(
                    "Connection attempt timed out after {}ms",
                    connect_timeout.as_millis()
                )))
            }
        };
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Run one Redis operation under the store timeout. Connection-level
    /// failures drop the cached connection so the next call reconnects.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, Error>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match timeout(self.timeout, f(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    *self.conn.write().await = None;
                }
                Err(store_unavailable(format!("Redis {op} failed: {e}")))
            }
            Err(_) => Err(store_unavailable(format!(
                "Redis {op} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn touch_counter(
        &self,
        principal_id: UserId,
        period: &Period,
        delta: u64,
    ) -> Result<u64, Error> {
        let key = counter_key(principal_id, &period.key);
        let expire_at = (period.end + self.retention).timestamp();
        let script = &self.touch_counter_script;
        let count: i64 = self
            .run("touch counter", |mut conn| async move {
                script
                    .key(&key)
                    .arg(period.kind.to_string())
                    .arg(period.start.timestamp())
                    .arg(period.end.timestamp())
                    .arg(expire_at)
                    .arg(delta)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count.max(0).unsigned_abs())
    }

    async fn scan_counter_keys(&self) -> Result<Vec<String>, Error> {
        let pattern = format!("{COUNTER_KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .run("SCAN", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

/// Rebuild a counter from its key and hash fields. Returns `None` for keys
/// that do not follow the counter layout.
fn parse_counter(key: &str, fields: &HashMap<String, String>) -> Option<UsageCounter> {
    let (principal, period_key) = key.strip_prefix(COUNTER_KEY_PREFIX)?.split_once(':')?;
    let timestamp = |field: &str| {
        fields
            .get(field)?
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    };
    Some(UsageCounter {
        principal_id: UserId(principal.parse().ok()?),
        period_key: period_key.to_string(),
        period_kind: PeriodKind::from_str(fields.get("period_kind")?).ok()?,
        count: fields.get("count")?.parse().ok()?,
        period_start: timestamp("period_start")?,
        period_end: timestamp("period_end")?,
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get_or_create(
        &self,
        principal_id: UserId,
        period: &Period,
    ) -> Result<UsageCounter, Error> {
        let count = self.touch_counter(principal_id, period, 0).await?;
        Ok(UsageCounter {
            count,
            ..UsageCounter::empty(principal_id, period)
        })
    }

    async fn increment(&self, principal_id: UserId, period: &Period) -> Result<u64, Error> {
        self.touch_counter(principal_id, period, 1).await
    }

    async fn reset(&self, principal_id: UserId, period_key: &str) -> Result<bool, Error> {
        let key = counter_key(principal_id, period_key);
        let script = &self.reset_counter_script;
        let existed: i64 = self
            .run("reset counter", |mut conn| async move {
                script.key(&key).invoke_async(&mut conn).await
            })
            .await?;
        Ok(existed == 1)
    }

    async fn acquire_slot(&self, principal_id: UserId) -> Result<u32, Error> {
        let key = in_flight_key(principal_id);
        let script = &self.acquire_slot_script;
        let ttl = self.slot_ttl_secs;
        let in_flight: i64 = self
            .run("acquire slot", |mut conn| async move {
                script.key(&key).arg(ttl).invoke_async(&mut conn).await
            })
            .await?;
        Ok(u32::try_from(in_flight.max(0)).unwrap_or(u32::MAX))
    }

    async fn release_slot(&self, principal_id: UserId) -> Result<(), Error> {
        let key = in_flight_key(principal_id);
        let script = &self.release_slot_script;
        let _: i64 = self
            .run("release slot", |mut conn| async move {
                script.key(&key).invoke_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn in_flight(&self, principal_id: UserId) -> Result<u32, Error> {
        let key = in_flight_key(principal_id);
        let in_flight: Option<i64> = self
            .run("read in-flight", |mut conn| async move { conn.get(&key).await })
            .await?;
        Ok(u32::try_from(in_flight.unwrap_or(0).max(0)).unwrap_or(u32::MAX))
    }

    async fn list_counters(&self) -> Result<Vec<UsageCounter>, Error> {
        let keys = self.scan_counter_keys().await?;
        let mut counters = Vec::with_capacity(keys.len());
        for key in keys {
            let lookup = key.as_str();
            let fields: HashMap<String, String> = self
                .run("HGETALL", |mut conn| async move { conn.hgetall(lookup).await })
                .await?;
            // The key may have expired between SCAN and HGETALL.
            if fields.is_empty() {
                continue;
            }
            match parse_counter(&key, &fields) {
                Some(counter) => counters.push(counter),
                None => warn!(key = %key, "Skipping malformed usage counter"),
            }
        }
        Ok(counters)
    }

    async fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize, Error> {
        Ok(0)
    }

    async fn ping(&self) -> Result<(), Error> {
        let _: String = self
            .run("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_keys() {
        assert_eq!(counter_key(UserId(12), "2024-06"), "usage_counter:12:2024-06");
        assert_eq!(in_flight_key(UserId(12)), "quota_inflight:12");
    }

    #[test]
    fn test_parse_counter() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let fields = HashMap::from([
            ("count".to_string(), "41".to_string()),
            ("period_kind".to_string(), "monthly".to_string()),
            ("period_start".to_string(), start.timestamp().to_string()),
            ("period_end".to_string(), end.timestamp().to_string()),
        ]);
        let counter = parse_counter("usage_counter:12:2024-06", &fields).unwrap();
        assert_eq!(
            counter,
            UsageCounter {
                principal_id: UserId(12),
                period_key: "2024-06".to_string(),
                period_kind: PeriodKind::Monthly,
                count: 41,
                period_start: start,
                period_end: end,
            }
        );

        assert!(parse_counter("usage_counter:abc:2024-06", &fields).is_none());
        assert!(parse_counter("quota_inflight:12", &fields).is_none());
        let mut missing = fields.clone();
        missing.remove("period_end");
        assert!(parse_counter("usage_counter:12:2024-06", &missing).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_store_unavailable() {
        let config = RedisStoreConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let store = RedisCounterStore::connect("redis://127.0.0.1:1/", &config, 90)
            .await
            .unwrap();
        let err = store.ping().await.unwrap_err();
        assert!(err.is_store_unavailable(), "{err}");
        let err = store.acquire_slot(UserId(1)).await.unwrap_err();
        assert!(err.is_store_unavailable(), "{err}");
    }
}
