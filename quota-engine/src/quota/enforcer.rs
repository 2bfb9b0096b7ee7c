use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::policy::{self, DenyReason, QuotaDecision};
use super::{EnforcementMetrics, QuotaHeaders};
use crate::config::{QuotaConfig, StoreFailurePolicy};
use crate::counter::CounterStore;
use crate::error::{Error, ErrorDetails};
use crate::period::{Period, PeriodKind};
use crate::plan::{Plan, PlanId, PlanStore};
use crate::principal::{Principal, UserId};

/// Runtime form of the `[quota]` policy knobs
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    pub store_failure: StoreFailurePolicy,
    pub quota_exceeded_status: StatusCode,
    pub plan_restricted_status: StatusCode,
    pub store_unavailable_retry_after: Duration,
}

impl EnforcementSettings {
    pub fn from_config(config: &QuotaConfig) -> Result<Self, Error> {
        let status = |code: u16| {
            StatusCode::from_u16(code).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid status code {code}: {e}"),
                })
            })
        };
        Ok(Self {
            store_failure: config.store_failure,
            quota_exceeded_status: status(config.quota_exceeded_status)?,
            plan_restricted_status: status(config.plan_restricted_status)?,
            store_unavailable_retry_after: Duration::from_secs(
                config.store_unavailable_retry_after_secs,
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    QuotaExceeded,
    ConcurrencyLimit,
    PlanRestricted { message: String },
    StoreUnavailable,
}

impl From<DenyReason> for DenialReason {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::QuotaExceeded => DenialReason::QuotaExceeded,
            DenyReason::ConcurrencyLimit => DenialReason::ConcurrencyLimit,
        }
    }
}

/// A request the engine refused. This is an expected outcome, not an `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenial {
    pub reason: DenialReason,
    pub status: StatusCode,
    pub headers: Option<QuotaHeaders>,
    /// Seconds
    pub retry_after: Option<u64>,
}

impl QuotaDenial {
    pub fn message(&self) -> String {
        match &self.reason {
            DenialReason::QuotaExceeded => "Request quota for the current period exceeded".to_string(),
            DenialReason::ConcurrencyLimit => "Too many concurrent requests".to_string(),
            DenialReason::PlanRestricted { message } => message.clone(),
            DenialReason::StoreUnavailable => {
                "Quota enforcement is temporarily unavailable".to_string()
            }
        }
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut headers = self
            .headers
            .as_ref()
            .map(QuotaHeaders::to_header_map)
            .unwrap_or_default();
        if let Some(retry_after) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        headers
    }
}

/// Holds one of the principal's in-flight slots.
///
/// Call [`ConcurrencySlot::release`] on the normal path. If the guard is
/// dropped instead (handler panic, client disconnect, timeout) the release is
/// spawned onto the current runtime.
pub struct ConcurrencySlot {
    store: Arc<dyn CounterStore>,
    principal_id: UserId,
    released: bool,
}

impl ConcurrencySlot {
    fn new(store: Arc<dyn CounterStore>, principal_id: UserId) -> Self {
        Self {
            store,
            principal_id,
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.release_slot(self.principal_id).await {
            warn!(user_id = %self.principal_id, "Failed to release concurrency slot: {e}");
        }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let principal_id = self.principal_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release_slot(principal_id).await {
                        warn!(user_id = %principal_id, "Failed to release concurrency slot: {e}");
                    }
                });
            }
            Err(_) => {
                warn!(user_id = %principal_id, "Concurrency slot dropped outside a runtime; it will expire on its own");
            }
        }
    }
}

pub struct Admission {
    pub plan: Arc<Plan>,
    /// `None` when the request was admitted without consulting the store
    pub headers: Option<QuotaHeaders>,
    pub slot: Option<ConcurrencySlot>,
}

impl Admission {
    /// Give back the concurrency slot, if one was taken.
    pub async fn finish(self) {
        if let Some(slot) = self.slot {
            slot.release().await;
        }
    }
}

pub enum Enforcement {
    Admitted(Admission),
    Denied(QuotaDenial),
}

impl Enforcement {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Enforcement::Admitted(_))
    }
}

/// The caller's view of their own usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStatus {
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub period_kind: PeriodKind,
    pub period_key: String,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub in_flight: u32,
    pub concurrency_limit: u32,
    pub reset_at: DateTime<Utc>,
}

/// Decides, per request, whether a principal may proceed.
pub struct QuotaEnforcer {
    store: Arc<dyn CounterStore>,
    plans: PlanStore,
    settings: EnforcementSettings,
    metrics: Arc<EnforcementMetrics>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn CounterStore>, plans: PlanStore, settings: EnforcementSettings) -> Self {
        Self {
            store,
            plans,
            settings,
            metrics: Arc::new(EnforcementMetrics::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn metrics(&self) -> &EnforcementMetrics {
        &self.metrics
    }

    pub async fn enforce(&self, principal: &Principal) -> Enforcement {
        self.enforce_at(principal, Utc::now()).await
    }

    /// Resolve the plan, take a concurrency slot, read the counter, decide, and
    /// count the request on allow. A denied request never touches the counter.
    ///
    /// The read and the increment are separate steps, so requests racing at the
    /// limit can all be admitted; the overrun is bounded by the principal's
    /// in-flight requests, which the concurrency limit caps.
    pub async fn enforce_at(&self, principal: &Principal, now: DateTime<Utc>) -> Enforcement {
        if !principal.is_active {
            return self.deny(
                principal,
                QuotaDenial {
                    reason: DenialReason::PlanRestricted {
                        message: format!("User {} is inactive", principal.user_id),
                    },
                    status: self.settings.plan_restricted_status,
                    headers: None,
                    retry_after: None,
                },
            );
        }

        let plan = match self.plans.resolve(principal) {
            Ok(plan) => plan,
            Err(e) => {
                return self.deny(
                    principal,
                    QuotaDenial {
                        reason: DenialReason::PlanRestricted {
                            message: e.to_string(),
                        },
                        status: self.settings.plan_restricted_status,
                        headers: None,
                        retry_after: None,
                    },
                )
            }
        };
        let period = Period::containing(plan.period, now);

        let in_flight = match self.store.acquire_slot(principal.user_id).await {
            Ok(in_flight) => in_flight,
            Err(e) => return self.store_failure(principal, plan, e, None),
        };
        let slot = ConcurrencySlot::new(Arc::clone(&self.store), principal.user_id);

        let counter = match self.store.get_or_create(principal.user_id, &period).await {
            Ok(counter) => counter,
            Err(e) => return self.store_failure(principal, plan, e, Some(slot)),
        };

        match policy::evaluate(&plan, counter.count, in_flight.saturating_sub(1), &period, now) {
            QuotaDecision::Allow {
                limit, reset_at, ..
            } => {
                let count = match self.store.increment(principal.user_id, &period).await {
                    Ok(count) => count,
                    Err(e) => return self.store_failure(principal, plan, e, Some(slot)),
                };
                let remaining = limit.saturating_sub(count);
                self.metrics.record_allowed();
                debug!(
                    user_id = %principal.user_id,
                    plan_id = %plan.id,
                    period_key = %period.key,
                    count,
                    remaining,
                    "Quota check passed"
                );
                Enforcement::Admitted(Admission {
                    plan,
                    headers: Some(QuotaHeaders::new(limit, remaining, reset_at)),
                    slot: Some(slot),
                })
            }
            QuotaDecision::Deny {
                reason,
                limit,
                reset_at,
                retry_after,
            } => {
                slot.release().await;
                self.deny(
                    principal,
                    QuotaDenial {
                        reason: reason.into(),
                        status: self.settings.quota_exceeded_status,
                        headers: Some(QuotaHeaders::new(
                            limit,
                            limit.saturating_sub(counter.count),
                            reset_at,
                        )),
                        retry_after: Some(retry_after.as_secs()),
                    },
                )
            }
        }
    }

    fn deny(&self, principal: &Principal, denial: QuotaDenial) -> Enforcement {
        self.metrics.record_denied(&denial.reason);
        info!(
            user_id = %principal.user_id,
            reason = ?denial.reason,
            status = denial.status.as_u16(),
            "Request denied"
        );
        Enforcement::Denied(denial)
    }

    fn store_failure(
        &self,
        principal: &Principal,
        plan: Arc<Plan>,
        error: Error,
        slot: Option<ConcurrencySlot>,
    ) -> Enforcement {
        self.metrics.record_store_error();
        match self.settings.store_failure {
            StoreFailurePolicy::FailOpen => {
                warn!(
                    user_id = %principal.user_id,
                    "Admitting request without quota accounting: {error}"
                );
                self.metrics.record_fail_open();
                Enforcement::Admitted(Admission {
                    plan,
                    headers: None,
                    slot,
                })
            }
            StoreFailurePolicy::FailClosed => {
                drop(slot);
                self.deny(
                    principal,
                    QuotaDenial {
                        reason: DenialReason::StoreUnavailable,
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        headers: None,
                        retry_after: Some(self.settings.store_unavailable_retry_after.as_secs()),
                    },
                )
            }
        }
    }

    pub async fn usage_status(&self, principal: &Principal) -> Result<UsageStatus, Error> {
        self.usage_status_at(principal, Utc::now()).await
    }

    pub async fn usage_status_at(
        &self,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<UsageStatus, Error> {
        let plan = self.plans.resolve(principal)?;
        let period = Period::containing(plan.period, now);
        let counter = self.store.get_or_create(principal.user_id, &period).await?;
        let in_flight = self.store.in_flight(principal.user_id).await?;
        Ok(UsageStatus {
            user_id: principal.user_id,
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            period_kind: plan.period,
            period_key: period.key,
            count: counter.count,
            limit: plan.request_limit_per_period,
            remaining: plan.request_limit_per_period.saturating_sub(counter.count),
            in_flight,
            concurrency_limit: plan.concurrency_limit,
            reset_at: period.end,
        })
    }

    /// Operator reset. With an explicit key only that counter is reset;
    /// otherwise the user's current daily and monthly counters are. Returns the
    /// keys that existed and were reset.
    pub async fn reset_usage(
        &self,
        user_id: UserId,
        period_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, Error> {
        let keys = match period_key {
            Some(key) => vec![Period::parse_key(key)?.key],
            None => [PeriodKind::Daily, PeriodKind::Monthly]
                .into_iter()
                .map(|kind| Period::containing(kind, now).key)
                .collect(),
        };
        let mut reset = Vec::new();
        for key in keys {
            if self.store.reset(user_id, &key).await? {
                reset.push(key);
            }
        }
        info!(user_id = %user_id, keys = ?reset, "Usage counters reset");
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use crate::plan::NoPlanPolicy;
    use crate::testing::{principal, test_plan, FailingCounterStore};
    use chrono::TimeZone;
    use tracing_test::traced_test;

    fn settings(store_failure: StoreFailurePolicy) -> EnforcementSettings {
        EnforcementSettings {
            store_failure,
            quota_exceeded_status: StatusCode::TOO_MANY_REQUESTS,
            plan_restricted_status: StatusCode::FORBIDDEN,
            store_unavailable_retry_after: Duration::from_secs(30),
        }
    }

    fn enforcer_with(store: Arc<dyn CounterStore>, plan: Plan) -> QuotaEnforcer {
        let plans = PlanStore::new(NoPlanPolicy::Deny);
        plans.upsert_plan(plan);
        QuotaEnforcer::new(store, plans, settings(StoreFailurePolicy::FailClosed))
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn admitted(enforcement: Enforcement) -> Admission {
        match enforcement {
            Enforcement::Admitted(admission) => admission,
            Enforcement::Denied(denial) => panic!("expected admission, got {denial:?}"),
        }
    }

    fn denied(enforcement: Enforcement) -> QuotaDenial {
        match enforcement {
            Enforcement::Admitted(_) => panic!("expected denial"),
            Enforcement::Denied(denial) => denial,
        }
    }

    #[tokio::test]
    async fn test_daily_quota_scenario() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let enforcer = enforcer_with(Arc::clone(&store), test_plan(1, 3, 5, PeriodKind::Daily));
        let user = principal(10, Some(1));

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let admission = admitted(enforcer.enforce_at(&user, morning()).await);
            remaining.push(admission.headers.as_ref().unwrap().remaining);
            admission.finish().await;
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let denial = denied(enforcer.enforce_at(&user, morning()).await);
        assert_eq!(denial.reason, DenialReason::QuotaExceeded);
        assert_eq!(denial.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denial.retry_after, Some(15 * 3600));
        assert_eq!(denial.header_map()["retry-after"], "54000");

        // Denials are not counted.
        let today = Period::containing(PeriodKind::Daily, morning());
        assert_eq!(store.get_or_create(UserId(10), &today).await.unwrap().count, 3);

        let tomorrow = morning() + chrono::Duration::days(1);
        let admission = admitted(enforcer.enforce_at(&user, tomorrow).await);
        assert_eq!(admission.headers.as_ref().unwrap().remaining, 2);
        admission.finish().await;

        // The previous period is left as it was.
        assert_eq!(store.get_or_create(UserId(10), &today).await.unwrap().count, 3);
        assert_eq!(enforcer.metrics().snapshot().allowed, 4);
        assert_eq!(enforcer.metrics().snapshot().denied_quota, 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_release() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let enforcer = enforcer_with(Arc::clone(&store), test_plan(1, 100, 2, PeriodKind::Daily));
        let user = principal(4, Some(1));

        let first = admitted(enforcer.enforce_at(&user, morning()).await);
        let second = admitted(enforcer.enforce_at(&user, morning()).await);
        let denial = denied(enforcer.enforce_at(&user, morning()).await);
        assert_eq!(denial.reason, DenialReason::ConcurrencyLimit);
        assert_eq!(denial.retry_after, Some(1));
        assert_eq!(store.in_flight(UserId(4)).await.unwrap(), 2);

        first.finish().await;
        assert_eq!(store.in_flight(UserId(4)).await.unwrap(), 1);
        let third = admitted(enforcer.enforce_at(&user, morning()).await);

        second.finish().await;
        third.finish().await;
        assert_eq!(store.in_flight(UserId(4)).await.unwrap(), 0);

        // Only admitted requests were counted.
        let today = Period::containing(PeriodKind::Daily, morning());
        assert_eq!(store.get_or_create(UserId(4), &today).await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_dropped_slot_is_released() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let enforcer = enforcer_with(Arc::clone(&store), test_plan(1, 100, 1, PeriodKind::Daily));
        let user = principal(8, Some(1));

        let admission = admitted(enforcer.enforce_at(&user, morning()).await);
        drop(admission);
        // The release runs on a spawned task.
        for _ in 0..100 {
            if store.in_flight(UserId(8)).await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.in_flight(UserId(8)).await.unwrap(), 0);
        assert!(enforcer.enforce_at(&user, morning()).await.is_admitted());
    }

    #[tokio::test]
    async fn test_plan_restricted() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let enforcer = enforcer_with(store, test_plan(1, 100, 1, PeriodKind::Daily));

        let denial = denied(enforcer.enforce_at(&principal(2, None), morning()).await);
        assert_eq!(denial.status, StatusCode::FORBIDDEN);
        assert!(matches!(denial.reason, DenialReason::PlanRestricted { .. }));
        assert!(denial.header_map().is_empty());

        let denial = denied(enforcer.enforce_at(&principal(2, Some(77)), morning()).await);
        assert!(denial.message().contains("plan 77"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_policies() {
        let plans = PlanStore::new(NoPlanPolicy::Deny);
        plans.upsert_plan(test_plan(1, 10, 1, PeriodKind::Monthly));
        let store: Arc<dyn CounterStore> = Arc::new(FailingCounterStore);
        let user = principal(1, Some(1));

        let open = QuotaEnforcer::new(
            Arc::clone(&store),
            plans.clone(),
            settings(StoreFailurePolicy::FailOpen),
        );
        let admission = admitted(open.enforce_at(&user, morning()).await);
        assert!(admission.headers.is_none());
        assert!(admission.slot.is_none());
        assert!(logs_contain("Admitting request without quota accounting"));
        assert_eq!(open.metrics().snapshot().fail_open_admissions, 1);

        let closed = QuotaEnforcer::new(store, plans, settings(StoreFailurePolicy::FailClosed));
        let denial = denied(closed.enforce_at(&user, morning()).await);
        assert_eq!(denial.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(denial.reason, DenialReason::StoreUnavailable);
        assert_eq!(denial.header_map()["retry-after"], "30");
    }

    #[tokio::test]
    async fn test_usage_status_and_reset() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let enforcer = enforcer_with(store, test_plan(1, 5, 2, PeriodKind::Daily));
        let user = principal(6, Some(1));
        for _ in 0..2 {
            admitted(enforcer.enforce_at(&user, morning()).await).finish().await;
        }
        let status = enforcer.usage_status_at(&user, morning()).await.unwrap();
        assert_eq!(status.count, 2);
        assert_eq!(status.remaining, 3);
        assert_eq!(status.period_key, "2024-07-01");
        assert_eq!(status.in_flight, 0);

        let reset = enforcer.reset_usage(UserId(6), None, morning()).await.unwrap();
        assert_eq!(reset, vec!["2024-07-01".to_string()]);
        assert_eq!(enforcer.usage_status_at(&user, morning()).await.unwrap().count, 0);

        let err = enforcer
            .reset_usage(UserId(6), Some("July"), morning())
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidPeriodKey { .. }));
    }
}
