//! Tests against a live Redis and ClickHouse.
//!
//! Run with `cargo test --features e2e_tests` after exporting
//! `QUOTA_E2E_REDIS_URL` (e.g. `redis://127.0.0.1:6379`) and
//! `QUOTA_E2E_CLICKHOUSE_URL` (e.g. `http://127.0.0.1:8123`).

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use url::Url;

use quota_engine::config::{ClickHouseConfig, ReconcilerConfig, RedisStoreConfig};
use quota_engine::counter::{CounterStore, RedisCounterStore, UsageCounter};
use quota_engine::durable::{ClickHouseUsageRepository, UsageRepository};
use quota_engine::period::{Period, PeriodKind};
use quota_engine::principal::UserId;
use quota_engine::reconciler::UsageReconciler;

/// A user id no other run has touched.
fn fresh_user() -> UserId {
    UserId(uuid::Uuid::now_v7().as_u128() as u64 >> 1)
}

async fn redis_store() -> RedisCounterStore {
    let url = std::env::var("QUOTA_E2E_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisCounterStore::connect(&url, &RedisStoreConfig::default(), 1)
        .await
        .unwrap()
}

async fn clickhouse_repository() -> ClickHouseUsageRepository {
    let url = std::env::var("QUOTA_E2E_CLICKHOUSE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8123".to_string());
    let config = ClickHouseConfig {
        url: Url::parse(&url).unwrap(),
        database: "default".to_string(),
        table: "UsageCounterE2E".to_string(),
        user: None,
        password_env: None,
    };
    ClickHouseUsageRepository::new(&config, Client::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_redis_concurrent_increments_are_exact() {
    let store = Arc::new(redis_store().await);
    let user = fresh_user();
    let period = Period::containing(PeriodKind::Daily, Utc::now());

    let tasks = (0..100).map(|_| {
        let store = Arc::clone(&store);
        let period = period.clone();
        async move { store.increment(user, &period).await.unwrap() }
    });
    let mut counts = join_all(tasks).await;
    counts.sort_unstable();
    assert_eq!(counts, (1..=100).collect::<Vec<u64>>());

    let counter = store.get_or_create(user, &period).await.unwrap();
    assert_eq!(counter.count, 100);
    assert_eq!(counter.period_key, period.key);

    assert!(store.reset(user, &period.key).await.unwrap());
    assert_eq!(store.get_or_create(user, &period).await.unwrap().count, 0);
}

#[tokio::test]
async fn test_redis_slots() {
    let store = redis_store().await;
    let user = fresh_user();

    assert_eq!(store.acquire_slot(user).await.unwrap(), 1);
    assert_eq!(store.acquire_slot(user).await.unwrap(), 2);
    assert_eq!(store.in_flight(user).await.unwrap(), 2);
    store.release_slot(user).await.unwrap();
    store.release_slot(user).await.unwrap();
    // Releasing more than was acquired never goes negative
    store.release_slot(user).await.unwrap();
    assert_eq!(store.in_flight(user).await.unwrap(), 0);
    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_clickhouse_latest_flush_wins() {
    let repository = clickhouse_repository().await;
    repository.health().await.unwrap();
    let user = fresh_user();
    let period = Period::containing(PeriodKind::Monthly, Utc::now());

    let mut counter = UsageCounter::empty(user, &period);
    counter.count = 40;
    repository
        .upsert_counters(std::slice::from_ref(&counter))
        .await
        .unwrap();
    let first = repository
        .get_counter(user, &period.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.counter, counter);

    // A second repository stands in for another replica with no flush cache
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    clickhouse_repository()
        .await
        .upsert_counters(std::slice::from_ref(&counter))
        .await
        .unwrap();
    let stored = repository
        .get_counter(user, &period.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, first);

    // A reset lowers the count; the later write still replaces the earlier one
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    counter.count = 2;
    repository
        .upsert_counters(std::slice::from_ref(&counter))
        .await
        .unwrap();
    let history = repository.history(user, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].counter.count, 2);
}

#[tokio::test]
async fn test_reconciler_redis_to_clickhouse() {
    let store: Arc<dyn CounterStore> = Arc::new(redis_store().await);
    let repository: Arc<dyn UsageRepository> = Arc::new(clickhouse_repository().await);
    let reconciler = UsageReconciler::new(
        Arc::clone(&store),
        Arc::clone(&repository),
        ReconcilerConfig::default(),
    );
    let user = fresh_user();
    let period = Period::containing(PeriodKind::Daily, Utc::now());
    for _ in 0..7 {
        store.increment(user, &period).await.unwrap();
    }

    let first = reconciler.flush_once().await.unwrap();
    assert!(first.flushed >= 1);
    let stored = repository
        .get_counter(user, &period.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.counter.count, 7);

    // Nothing changed for this user, so a second flush leaves the row alone
    reconciler.flush_once().await.unwrap();
    let again = repository
        .get_counter(user, &period.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.updated_at, stored.updated_at);
}
