//! The quota decision itself. Everything here is pure: no I/O, no clock reads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::period::Period;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    QuotaExceeded,
    ConcurrencyLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow {
        limit: u64,
        /// Requests left after this one is counted
        remaining: u64,
        reset_at: DateTime<Utc>,
    },
    Deny {
        reason: DenyReason,
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow { .. })
    }
}

/// Period-quota check: allow iff `current_count < limit`.
pub fn check_period_quota(
    plan: &Plan,
    current_count: u64,
    period: &Period,
    now: DateTime<Utc>,
) -> QuotaDecision {
    let limit = plan.request_limit_per_period;
    if current_count < limit {
        QuotaDecision::Allow {
            limit,
            remaining: limit - current_count - 1,
            reset_at: period.end,
        }
    } else {
        QuotaDecision::Deny {
            reason: DenyReason::QuotaExceeded,
            limit,
            reset_at: period.end,
            retry_after: period.retry_after(now),
        }
    }
}

/// Concurrency check: `in_flight` excludes the request being decided.
pub fn within_concurrency_limit(plan: &Plan, in_flight: u32) -> bool {
    in_flight < plan.concurrency_limit
}

/// Full decision for one request. Both checks run; the period-quota denial is
/// reported when both fail.
pub fn evaluate(
    plan: &Plan,
    current_count: u64,
    in_flight: u32,
    period: &Period,
    now: DateTime<Utc>,
) -> QuotaDecision {
    let decision = check_period_quota(plan, current_count, period, now);
    if !decision.is_allowed() || within_concurrency_limit(plan, in_flight) {
        return decision;
    }
    QuotaDecision::Deny {
        reason: DenyReason::ConcurrencyLimit,
        limit: plan.request_limit_per_period,
        reset_at: period.end,
        retry_after: CONCURRENCY_RETRY_AFTER,
    }
}

/// `Retry-After` sent with concurrency denials
pub const CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(1);
