use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;

pub const QUOTA_ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn status_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": QUOTA_ENGINE_VERSION,
    }))
}

/// Reports reachability of the counter store and the durable store.
///
/// Only the counter store decides the status code: it sits on the request
/// path, the durable store does not.
pub async fn health_handler(State(app_state): AppState) -> Response {
    let counter_store = app_state.enforcer.store().ping().await;
    let durable_store = app_state.reconciler.repository().health().await;
    let status = if counter_store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let describe = |result: &Result<(), Error>| match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    (
        status,
        Json(json!({
            "gateway": "ok",
            "counter_store": describe(&counter_store),
            "durable_store": describe(&durable_store),
        })),
    )
        .into_response()
}

pub async fn metrics_handler(State(app_state): AppState) -> Result<String, Error> {
    match &app_state.metrics_handle {
        Some(handle) => Ok(handle.render()),
        None => Err(Error::new(ErrorDetails::RouteNotFound {
            path: "/metrics".to_string(),
            method: "GET".to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::get_unit_test_app_state_data;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_handler() {
        let app_state = get_unit_test_app_state_data(Arc::new(Config::default())).await;
        let response = health_handler(State(app_state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(
            &axum::body::to_bytes(response.into_body(), 1024).await.unwrap(),
        )
        .unwrap();
        assert_eq!(body["counter_store"], "ok");
        assert_eq!(body["durable_store"], "ok");
    }

    #[tokio::test]
    async fn test_metrics_handler_without_recorder() {
        let app_state = get_unit_test_app_state_data(Arc::new(Config::default())).await;
        let err = metrics_handler(State(app_state)).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_handler() {
        let Json(body) = status_handler().await;
        assert_eq!(body["version"], QUOTA_ENGINE_VERSION);
    }
}
