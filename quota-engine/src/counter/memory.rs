use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::{CounterStore, UsageCounter};
use crate::error::Error;
use crate::period::{Period, PeriodKind};
use crate::principal::UserId;

struct CounterEntry {
    count: AtomicU64,
    period_kind: PeriodKind,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

/// Single-process counter store backed by `DashMap`s of atomics.
///
/// Counter shard locks are only held long enough to clone the entry's `Arc`;
/// the arithmetic itself happens on the atomic. Slot entries are updated under
/// their shard lock and dropped once they reach zero.
pub struct MemoryCounterStore {
    counters: DashMap<(UserId, String), Arc<CounterEntry>>,
    in_flight: DashMap<UserId, AtomicU32>,
    retention: Duration,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_retention_days(90)
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_days(days: u32) -> Self {
        Self {
            counters: DashMap::new(),
            in_flight: DashMap::new(),
            retention: Duration::days(i64::from(days)),
        }
    }

    fn entry(&self, principal_id: UserId, period: &Period) -> Arc<CounterEntry> {
        let entry = self
            .counters
            .entry((principal_id, period.key.clone()))
            .or_insert_with(|| {
                Arc::new(CounterEntry {
                    count: AtomicU64::new(0),
                    period_kind: period.kind,
                    period_start: period.start,
                    period_end: period.end,
                })
            });
        Arc::clone(entry.value())
    }
}

fn to_counter(principal_id: UserId, period_key: &str, entry: &CounterEntry) -> UsageCounter {
    UsageCounter {
        principal_id,
        period_key: period_key.to_string(),
        period_kind: entry.period_kind,
        count: entry.count.load(Ordering::Acquire),
        period_start: entry.period_start,
        period_end: entry.period_end,
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get_or_create(
        &self,
        principal_id: UserId,
        period: &Period,
    ) -> Result<UsageCounter, Error> {
        let entry = self.entry(principal_id, period);
        Ok(to_counter(principal_id, &period.key, &entry))
    }

    async fn increment(&self, principal_id: UserId, period: &Period) -> Result<u64, Error> {
        let entry = self.entry(principal_id, period);
        Ok(entry.count.fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn reset(&self, principal_id: UserId, period_key: &str) -> Result<bool, Error> {
        let entry = self
            .counters
            .get(&(principal_id, period_key.to_string()))
            .map(|entry| Arc::clone(entry.value()));
        match entry {
            Some(entry) => {
                entry.count.store(0, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_slot(&self, principal_id: UserId) -> Result<u32, Error> {
        // The shard lock is held across the add so a concurrent release cannot
        // drop the entry in between.
        let slots = self
            .in_flight
            .entry(principal_id)
            .or_insert_with(|| AtomicU32::new(0));
        Ok(slots.fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn release_slot(&self, principal_id: UserId) -> Result<(), Error> {
        // Decrement and drop idle entries under one shard lock.
        self.in_flight.remove_if(&principal_id, |_, slots| {
            // `fetch_update` only fails when the closure returns `None`, i.e. already at zero.
            let _ = slots.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
            slots.load(Ordering::Acquire) == 0
        });
        Ok(())
    }

    async fn in_flight(&self, principal_id: UserId) -> Result<u32, Error> {
        Ok(self
            .in_flight
            .get(&principal_id)
            .map(|entry| entry.value().load(Ordering::Acquire))
            .unwrap_or(0))
    }

    async fn list_counters(&self) -> Result<Vec<UsageCounter>, Error> {
        Ok(self
            .counters
            .iter()
            .map(|entry| {
                let (principal_id, period_key) = entry.key();
                to_counter(*principal_id, period_key, entry.value())
            })
            .collect())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let cutoff = now - self.retention;
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.period_end >= cutoff);
        Ok(before.saturating_sub(self.counters.len()))
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period() -> Period {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Period::containing(PeriodKind::Daily, now)
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_stable() {
        let store = MemoryCounterStore::new();
        let counter = store.get_or_create(UserId(1), &period()).await.unwrap();
        assert_eq!(counter.count, 0);
        assert_eq!(counter.period_key, "2024-05-01");
        assert_eq!(store.list_counters().await.unwrap().len(), 1);

        store.get_or_create(UserId(1), &period()).await.unwrap();
        assert_eq!(store.list_counters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.increment(UserId(5), &period()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let counter = store.get_or_create(UserId(5), &period()).await.unwrap();
        assert_eq!(counter.count, 2000);
    }

    #[tokio::test]
    async fn test_reset_only_touches_named_period() {
        let store = MemoryCounterStore::new();
        let today = period();
        let tomorrow = today.next();
        store.increment(UserId(2), &today).await.unwrap();
        store.increment(UserId(2), &tomorrow).await.unwrap();

        assert!(store.reset(UserId(2), &today.key).await.unwrap());
        assert!(!store.reset(UserId(2), "1999-01-01").await.unwrap());

        assert_eq!(store.get_or_create(UserId(2), &today).await.unwrap().count, 0);
        assert_eq!(store.get_or_create(UserId(2), &tomorrow).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_slots_floor_at_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.acquire_slot(UserId(3)).await.unwrap(), 1);
        assert_eq!(store.acquire_slot(UserId(3)).await.unwrap(), 2);
        store.release_slot(UserId(3)).await.unwrap();
        store.release_slot(UserId(3)).await.unwrap();
        store.release_slot(UserId(3)).await.unwrap();
        assert_eq!(store.in_flight(UserId(3)).await.unwrap(), 0);
        store.release_slot(UserId(99)).await.unwrap();
        assert_eq!(store.in_flight(UserId(99)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_slot_entries_are_dropped() {
        let store = MemoryCounterStore::new();
        for user in 0..50 {
            store.acquire_slot(UserId(user)).await.unwrap();
        }
        store.acquire_slot(UserId(0)).await.unwrap();
        assert_eq!(store.in_flight.len(), 50);

        for user in 0..50 {
            store.release_slot(UserId(user)).await.unwrap();
        }
        assert_eq!(store.in_flight.len(), 1);
        assert_eq!(store.in_flight(UserId(0)).await.unwrap(), 1);

        store.release_slot(UserId(0)).await.unwrap();
        assert!(store.in_flight.is_empty());
        assert_eq!(store.acquire_slot(UserId(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_expired() {
        let store = MemoryCounterStore::with_retention_days(1);
        let today = period();
        store.increment(UserId(1), &today).await.unwrap();
        store.increment(UserId(1), &today.next()).await.unwrap();
        let now = today.end + Duration::days(1) + Duration::seconds(1);
        assert_eq!(store.prune_expired(now).await.unwrap(), 1);
        let remaining = store.list_counters().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].period_key, today.next().key);
    }
}
