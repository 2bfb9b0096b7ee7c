//! Durable storage for flushed usage counters, keyed by `(principal_id, period_key)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::counter::UsageCounter;
use crate::error::Error;
use crate::principal::UserId;

pub mod clickhouse;

pub use clickhouse::ClickHouseUsageRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounter {
    #[serde(flatten)]
    pub counter: UsageCounter,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Insert or replace each counter. Writing a counter whose stored count is
    /// already equal must leave the stored row observably unchanged.
    async fn upsert_counters(&self, counters: &[UsageCounter]) -> Result<(), Error>;

    async fn get_counter(
        &self,
        principal_id: UserId,
        period_key: &str,
    ) -> Result<Option<PersistedCounter>, Error>;

    /// A principal's persisted counters, newest period first.
    async fn history(
        &self,
        principal_id: UserId,
        limit: usize,
    ) -> Result<Vec<PersistedCounter>, Error>;

    async fn health(&self) -> Result<(), Error>;

    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemoryUsageRepository {
    rows: DashMap<(UserId, String), PersistedCounter>,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn upsert_counters(&self, counters: &[UsageCounter]) -> Result<(), Error> {
        let now = Utc::now();
        for counter in counters {
            let key = (counter.principal_id, counter.period_key.clone());
            let unchanged = self
                .rows
                .get(&key)
                .is_some_and(|row| row.counter == *counter);
            if !unchanged {
                self.rows.insert(
                    key,
                    PersistedCounter {
                        counter: counter.clone(),
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_counter(
        &self,
        principal_id: UserId,
        period_key: &str,
    ) -> Result<Option<PersistedCounter>, Error> {
        Ok(self
            .rows
            .get(&(principal_id, period_key.to_string()))
            .map(|row| row.value().clone()))
    }

    async fn history(
        &self,
        principal_id: UserId,
        limit: usize,
    ) -> Result<Vec<PersistedCounter>, Error> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.key().0 == principal_id)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| b.counter.period_start.cmp(&a.counter.period_start));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
