//! Usage Reconciler - Copies live counters from the counter store into the durable store
//!
//! ## Design
//!
//! A background task wakes every `interval_secs` and also shortly after each
//! UTC midnight, so a period's final count is persisted soon after it closes.
//! Each flush:
//! - lists every live counter in the counter store
//! - skips counters whose count equals the last value flushed for that key
//! - upserts the rest, keyed by `(principal_id, period_key)`
//! - prunes counters that fell out of the retention window
//!
//! Failures are retried with exponential backoff (`backon`) and then logged.
//! Nothing here is on the request path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ReconcilerConfig;
use crate::counter::CounterStore;
use crate::durable::UsageRepository;
use crate::error::Error;
use crate::period::next_boundary;
use crate::principal::UserId;

/// Delay past a period boundary before the boundary flush runs
const BOUNDARY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub scanned: usize,
    pub flushed: usize,
    pub skipped: usize,
    pub pruned: usize,
}

#[derive(Clone)]
pub struct UsageReconciler {
    store: Arc<dyn CounterStore>,
    repository: Arc<dyn UsageRepository>,
    config: ReconcilerConfig,
    last_flushed: Arc<DashMap<(UserId, String), u64>>,
    // Serializes background and manual flushes against each other
    flush_lock: Arc<Mutex<()>>,
    handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl UsageReconciler {
    pub fn new(
        store: Arc<dyn CounterStore>,
        repository: Arc<dyn UsageRepository>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            repository,
            config,
            last_flushed: Arc::new(DashMap::new()),
            flush_lock: Arc::new(Mutex::new(())),
            handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn repository(&self) -> &Arc<dyn UsageRepository> {
        &self.repository
    }

    pub async fn flush_once(&self) -> Result<FlushReport, Error> {
        self.flush_at(Utc::now()).await
    }

    pub async fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport, Error> {
        let _guard = self.flush_lock.lock().await;

        let counters = self.store.list_counters().await?;
        let changed: Vec<_> = counters
            .iter()
            .filter(|counter| {
                self.last_flushed
                    .get(&(counter.principal_id, counter.period_key.clone()))
                    .is_none_or(|flushed| *flushed != counter.count)
            })
            .cloned()
            .collect();

        let mut report = FlushReport {
            scanned: counters.len(),
            skipped: counters.len() - changed.len(),
            ..Default::default()
        };

        if !changed.is_empty() {
            self.repository.upsert_counters(&changed).await?;
            for counter in &changed {
                self.last_flushed
                    .insert((counter.principal_id, counter.period_key.clone()), counter.count);
            }
            report.flushed = changed.len();
            metrics::counter!("quota_reconcile_flushed_total").increment(changed.len() as u64);
        }

        let live: HashSet<_> = counters
            .iter()
            .map(|counter| (counter.principal_id, counter.period_key.as_str()))
            .collect();
        self.last_flushed
            .retain(|(user_id, key), _| live.contains(&(*user_id, key.as_str())));

        report.pruned = self.store.prune_expired(now).await?;

        debug!(
            scanned = report.scanned,
            flushed = report.flushed,
            skipped = report.skipped,
            pruned = report.pruned,
            "Usage flush complete"
        );
        Ok(report)
    }

    /// [`Self::flush_once`] retried with exponential backoff.
    pub async fn flush_with_retry(&self) -> Result<FlushReport, Error> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.min_backoff_ms))
            .with_max_delay(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_times(self.config.max_retries);

        (|| self.flush_once())
            .retry(backoff)
            .notify(|e: &Error, delay: Duration| {
                warn!("Usage flush failed, retrying in {delay:?}: {e}");
            })
            .await
    }

    /// Spawn the background flush loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return;
        }
        let reconciler = self.clone();
        *handle = Some(tokio::spawn(async move { reconciler.run().await }));
    }

    /// Stop the background loop and run one last flush.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            handle.abort();
        }
        match self.flush_once().await {
            Ok(report) => info!(flushed = report.flushed, "Final usage flush complete"),
            Err(e) => error!("Final usage flush failed: {e}"),
        }
    }

    async fn run(self) {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(interval_secs = self.config.interval_secs, "Usage reconciler started");
        loop {
            tokio::time::sleep(next_wake(Utc::now(), interval)).await;
            match self.flush_with_retry().await {
                Ok(report) => {
                    if report.flushed > 0 {
                        info!(flushed = report.flushed, skipped = report.skipped, "Flushed usage counters");
                    }
                }
                Err(e) => {
                    metrics::counter!("quota_reconcile_failures_total").increment(1);
                    error!("Usage flush failed after {} retries: {e}", self.config.max_retries);
                }
            }
        }
    }
}

/// Time until the next flush: the regular interval or just past the next
/// UTC midnight, whichever comes first.
pub fn next_wake(now: DateTime<Utc>, interval: Duration) -> Duration {
    let until_boundary = (next_boundary(now) - now).to_std().unwrap_or_default() + BOUNDARY_GRACE;
    interval.min(until_boundary)
}
