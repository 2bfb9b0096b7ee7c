pub mod enforcer;
pub mod middleware;
pub mod policy;

pub use enforcer::{
    Admission, ConcurrencySlot, DenialReason, Enforcement, EnforcementSettings, QuotaDenial,
    QuotaEnforcer, UsageStatus,
};
pub use middleware::{quota_middleware, QuotaMiddlewareState, QuotaRejection};
pub use policy::{DenyReason, QuotaDecision};

use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota metadata attached to every enforced response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64, // Unix timestamp
}

impl QuotaHeaders {
    pub fn new(limit: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            limit,
            remaining,
            reset: reset_at.timestamp(),
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
        headers
    }
}

/// In-process counters for enforcement outcomes.
///
/// Mirrored into the `metrics` facade so they also show up on `/metrics`.
#[derive(Debug, Default)]
pub struct EnforcementMetrics {
    pub allowed: AtomicU64,
    pub denied_quota: AtomicU64,
    pub denied_concurrency: AtomicU64,
    pub denied_plan: AtomicU64,
    pub denied_store_unavailable: AtomicU64,
    pub fail_open_admissions: AtomicU64,
    pub store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnforcementMetricsSnapshot {
    pub allowed: u64,
    pub denied_quota: u64,
    pub denied_concurrency: u64,
    pub denied_plan: u64,
    pub denied_store_unavailable: u64,
    pub fail_open_admissions: u64,
    pub store_errors: u64,
}

impl EnforcementMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("quota_requests_total", "decision" => "allowed").increment(1);
    }

    pub fn record_denied(&self, reason: &DenialReason) {
        let (counter, label) = match reason {
            DenialReason::QuotaExceeded => (&self.denied_quota, "quota_exceeded"),
            DenialReason::ConcurrencyLimit => (&self.denied_concurrency, "concurrency_limit"),
            DenialReason::PlanRestricted { .. } => (&self.denied_plan, "plan_restricted"),
            DenialReason::StoreUnavailable => {
                (&self.denied_store_unavailable, "store_unavailable")
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("quota_requests_total", "decision" => label).increment(1);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_admissions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("quota_requests_total", "decision" => "fail_open").increment(1);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("quota_store_errors_total").increment(1);
    }

    pub fn snapshot(&self) -> EnforcementMetricsSnapshot {
        EnforcementMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied_quota: self.denied_quota.load(Ordering::Relaxed),
            denied_concurrency: self.denied_concurrency.load(Ordering::Relaxed),
            denied_plan: self.denied_plan.load(Ordering::Relaxed),
            denied_store_unavailable: self.denied_store_unavailable.load(Ordering::Relaxed),
            fail_open_admissions: self.fail_open_admissions.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
