use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::enforcer::{DenialReason, Enforcement, QuotaDenial, QuotaEnforcer};
use crate::error::Error;
use crate::principal::{extract_bearer_token, Auth};

/// Shared state for [`quota_middleware`]
#[derive(Clone)]
pub struct QuotaMiddlewareState {
    pub auth: Auth,
    pub enforcer: Arc<QuotaEnforcer>,
    pub exempt_paths: Arc<[String]>,
}

impl QuotaMiddlewareState {
    /// Exempt paths match whole segments: `/health` covers `/health/live`
    /// but not `/healthcheck`.
    fn is_exempt(&self, request: &Request) -> bool {
        let path = request.uri().path();
        request.method() == Method::OPTIONS
            || self.exempt_paths.iter().any(|prefix| {
                let prefix = prefix.trim_end_matches('/');
                path == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

/// Everything that stops a request at the quota layer
#[derive(Debug)]
pub enum QuotaRejection {
    /// Authentication failed
    Auth(Error),
    Denied(QuotaDenial),
}

impl IntoResponse for QuotaRejection {
    fn into_response(self) -> Response {
        match self {
            QuotaRejection::Auth(error) => error.into_response(),
            QuotaRejection::Denied(denial) => {
                let code = match &denial.reason {
                    DenialReason::QuotaExceeded => "quota_exceeded",
                    DenialReason::ConcurrencyLimit => "concurrency_limit_exceeded",
                    DenialReason::PlanRestricted { .. } => "plan_restricted",
                    DenialReason::StoreUnavailable => "quota_unavailable",
                };
                let body = serde_json::json!({
                    "error": {
                        "message": denial.message(),
                        "type": "quota_error",
                        "code": code,
                    }
                });
                let mut response = (denial.status, axum::Json(body)).into_response();
                response.headers_mut().extend(denial.header_map());
                response
            }
        }
    }
}

/// Enforce plan quotas on every request that reaches it.
///
/// The resolved [`crate::principal::Principal`] is inserted into the request
/// extensions for downstream handlers.
pub async fn quota_middleware(
    State(state): State<QuotaMiddlewareState>,
    mut request: Request,
    next: Next,
) -> Result<Response, QuotaRejection> {
    if state.is_exempt(&request) {
        return Ok(next.run(request).await);
    }

    let token = extract_bearer_token(request.headers()).map_err(QuotaRejection::Auth)?;
    let principal = state.auth.resolve(token).map_err(QuotaRejection::Auth)?;

    match state.enforcer.enforce(&principal).await {
        Enforcement::Admitted(admission) => {
            debug!(user_id = %principal.user_id, path = %request.uri().path(), "Request admitted");
            request.extensions_mut().insert(principal);
            let mut response = next.run(request).await;
            if let Some(headers) = &admission.headers {
                response.headers_mut().extend(headers.to_header_map());
            }
            admission.finish().await;
            Ok(response)
        }
        Enforcement::Denied(denial) => Err(QuotaRejection::Denied(denial)),
    }
}
