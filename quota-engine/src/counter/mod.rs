//! Per-principal, per-period request counters plus in-flight (concurrency) counters.
//!
//! The store is injected wherever it is used; there is no process-wide instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::period::{Period, PeriodKind};
use crate::principal::UserId;

pub mod memory;
pub mod redis;

pub use memory::MemoryCounterStore;
pub use redis::RedisCounterStore;

/// Request count for one principal in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub principal_id: UserId,
    pub period_key: String,
    pub period_kind: PeriodKind,
    pub count: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl UsageCounter {
    pub fn empty(principal_id: UserId, period: &Period) -> Self {
        Self {
            principal_id,
            period_key: period.key.clone(),
            period_kind: period.kind,
            count: 0,
            period_start: period.start,
            period_end: period.end,
        }
    }
}

/// Shared counter storage.
///
/// Every method fails with `StoreUnavailable` when the backing cache cannot be
/// reached. Increments are atomic in the backend; callers never read-then-write.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the counter for `period`, creating it at zero if absent.
    async fn get_or_create(&self, principal_id: UserId, period: &Period)
        -> Result<UsageCounter, Error>;

    /// Atomically add one request and return the new count.
    async fn increment(&self, principal_id: UserId, period: &Period) -> Result<u64, Error>;

    /// Set the counter for `period_key` back to zero. Returns `false` if no
    /// such counter exists.
    async fn reset(&self, principal_id: UserId, period_key: &str) -> Result<bool, Error>;

    /// Atomically add one in-flight request and return the new in-flight count.
    async fn acquire_slot(&self, principal_id: UserId) -> Result<u32, Error>;

    /// Atomically remove one in-flight request. Never goes below zero.
    async fn release_slot(&self, principal_id: UserId) -> Result<(), Error>;

    async fn in_flight(&self, principal_id: UserId) -> Result<u32, Error>;

    /// Every counter currently held, across principals and periods.
    async fn list_counters(&self) -> Result<Vec<UsageCounter>, Error>;

    /// Drop counters whose retention window ended before `now`. Backends with
    /// native key expiry return `Ok(0)`.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, Error>;

    async fn ping(&self) -> Result<(), Error>;

    fn name(&self) -> &'static str;
}
