//! Usage endpoints: a caller's own figures plus operator reset and flush.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::durable::PersistedCounter;
use crate::error::Error;
use crate::gateway_util::AppState;
use crate::principal::{require_admin, Principal, UserId};
use crate::quota::UsageStatus;
use crate::reconciler::FlushReport;

const DEFAULT_HISTORY_LIMIT: usize = 12;
const MAX_HISTORY_LIMIT: usize = 366;

pub async fn current_usage_handler(
    State(app_state): AppState,
    Extension(principal): Extension<Principal>,
) -> Result<Json<UsageStatus>, Error> {
    Ok(Json(app_state.enforcer.usage_status(&principal).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct UsageHistoryResponse {
    pub user_id: UserId,
    pub counters: Vec<PersistedCounter>,
}

/// Persisted counters only: anything counted since the last flush is not
/// reflected here.
pub async fn usage_history_handler(
    State(app_state): AppState,
    Extension(principal): Extension<Principal>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<UsageHistoryResponse>, Error> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let counters = app_state
        .reconciler
        .repository()
        .history(principal.user_id, limit)
        .await?;
    Ok(Json(UsageHistoryResponse {
        user_id: principal.user_id,
        counters,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub period_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub user_id: UserId,
    pub reset: Vec<String>,
}

pub async fn reset_usage_handler(
    State(app_state): AppState,
    Extension(principal): Extension<Principal>,
    Path(user_id): Path<u64>,
    Query(params): Query<ResetParams>,
) -> Result<Json<ResetResponse>, Error> {
    require_admin(&principal)?;
    let user_id = UserId(user_id);
    let reset = app_state
        .enforcer
        .reset_usage(user_id, params.period_key.as_deref(), Utc::now())
        .await?;
    info!(admin = %principal.user_id, user_id = %user_id, "Operator reset usage");
    Ok(Json(ResetResponse { user_id, reset }))
}

pub async fn persist_usage_handler(
    State(app_state): AppState,
    Extension(principal): Extension<Principal>,
) -> Result<Json<FlushReport>, Error> {
    require_admin(&principal)?;
    let report = app_state.reconciler.flush_once().await?;
    info!(admin = %principal.user_id, flushed = report.flushed, "Manual usage flush");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorDetails;
    use crate::gateway_util::AppStateData;
    use crate::period::{Period, PeriodKind};
    use crate::plan::PlanId;
    use crate::testing::{get_unit_test_app_state_data, principal, test_plan};
    use std::sync::Arc;

    async fn app_state() -> AppStateData {
        let app_state = get_unit_test_app_state_data(Arc::new(Config::default())).await;
        app_state
            .enforcer
            .plans()
            .upsert_plan(test_plan(1, 10, 2, PeriodKind::Daily));
        app_state
    }

    fn admin() -> Principal {
        Principal {
            is_admin: true,
            ..principal(99, None)
        }
    }

    #[tokio::test]
    async fn test_current_usage() {
        let app_state = app_state().await;
        let caller = principal(1, Some(1));
        let period = Period::containing(PeriodKind::Daily, Utc::now());
        for _ in 0..4 {
            app_state
                .enforcer
                .store()
                .increment(caller.user_id, &period)
                .await
                .unwrap();
        }

        let Json(status) = current_usage_handler(State(app_state), Extension(caller))
            .await
            .unwrap();
        assert_eq!(status.plan_id, PlanId(1));
        assert_eq!(status.count, 4);
        assert_eq!(status.remaining, 6);
        assert_eq!(status.period_key, period.key);
    }

    #[tokio::test]
    async fn test_history_after_persist() {
        let app_state = app_state().await;
        let caller = principal(1, Some(1));
        let period = Period::containing(PeriodKind::Daily, Utc::now());
        app_state
            .enforcer
            .store()
            .increment(caller.user_id, &period)
            .await
            .unwrap();

        let Json(history) = usage_history_handler(
            State(app_state.clone()),
            Extension(caller.clone()),
            Query(HistoryParams { limit: None }),
        )
        .await
        .unwrap();
        assert!(history.counters.is_empty());

        let Json(report) = persist_usage_handler(State(app_state.clone()), Extension(admin()))
            .await
            .unwrap();
        assert_eq!(report.flushed, 1);

        let Json(history) = usage_history_handler(
            State(app_state),
            Extension(caller),
            Query(HistoryParams { limit: Some(0) }),
        )
        .await
        .unwrap();
        assert_eq!(history.counters.len(), 1);
        assert_eq!(history.counters[0].counter.count, 1);
    }

    #[tokio::test]
    async fn test_admin_endpoints_require_admin() {
        let app_state = app_state().await;
        let caller = principal(1, Some(1));

        let err = persist_usage_handler(State(app_state.clone()), Extension(caller.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::PermissionDenied { .. }
        ));

        let err = reset_usage_handler(
            State(app_state),
            Extension(caller),
            Path(1),
            Query(ResetParams { period_key: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_reset_usage() {
        let app_state = app_state().await;
        let period = Period::containing(PeriodKind::Daily, Utc::now());
        for _ in 0..3 {
            app_state
                .enforcer
                .store()
                .increment(UserId(1), &period)
                .await
                .unwrap();
        }

        let Json(response) = reset_usage_handler(
            State(app_state.clone()),
            Extension(admin()),
            Path(1),
            Query(ResetParams {
                period_key: Some(period.key.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.reset, vec![period.key.clone()]);
        let counter = app_state
            .enforcer
            .store()
            .get_or_create(UserId(1), &period)
            .await
            .unwrap();
        assert_eq!(counter.count, 0);

        let err = reset_usage_handler(
            State(app_state),
            Extension(admin()),
            Path(1),
            Query(ResetParams {
                period_key: Some("last-week".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
