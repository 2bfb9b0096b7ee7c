use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use axum::Extension;

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::principal::Principal;

/// Header carrying the authenticated user id to the upstream application
pub const X_QUOTA_USER_ID: HeaderName = HeaderName::from_static("x-quota-user-id");

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Forward a metered `/api/{rest}` request to the configured upstream
/// application, unchanged apart from hop-by-hop headers.
pub async fn upstream_proxy_handler(
    State(app_state): AppState,
    Extension(principal): Extension<Principal>,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, Error> {
    let upstream = app_state
        .config
        .gateway
        .upstream
        .as_ref()
        .ok_or_else(|| Error::new(ErrorDetails::UpstreamNotConfigured))?;

    let target_url = upstream_url(upstream.url.as_str(), &rest, query.as_deref())?;

    let mut request = app_state
        .http_client
        .request(method, &target_url)
        .timeout(upstream.timeout());
    for (name, value) in headers.iter() {
        if should_forward_header(name.as_str()) {
            request = request.header(name.clone(), value.clone());
        }
    }
    request = request.header(X_QUOTA_USER_ID, HeaderValue::from(principal.user_id.0));

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::Upstream {
                message: format!("Failed to read request body: {e}"),
            })
        })?;
    if !body_bytes.is_empty() {
        request = request.body(body_bytes);
    }

    let upstream_response = request.send().await.map_err(|e| {
        Error::new(ErrorDetails::Upstream {
            message: format!("{target_url}: {}", DisplayOrDebugGateway::new(e)),
        })
    })?;
    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    let response_bytes = upstream_response.bytes().await.map_err(|e| {
        Error::new(ErrorDetails::Upstream {
            message: format!(
                "Failed to read upstream response: {}",
                DisplayOrDebugGateway::new(e)
            ),
        })
    })?;

    let mut response = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if should_forward_header(name.as_str()) {
            response = response.header(name.clone(), value.clone());
        }
    }
    response.body(Body::from(response_bytes)).map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to build proxy response: {e}"),
        })
    })
}

fn upstream_url(base: &str, rest: &str, query: Option<&str>) -> Result<String, Error> {
    if rest.split('/').any(|segment| segment == ".." || segment.eq_ignore_ascii_case("%2e%2e")) {
        return Err(Error::new(ErrorDetails::RouteNotFound {
            path: format!("/api/{rest}"),
            method: "*".to_string(),
        }));
    }
    let mut url = format!(
        "{}/api/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    );
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    Ok(url)
}

/// Hop-by-hop headers, `Host` and `Content-Length` stay behind; the client
/// recomputes them.
fn should_forward_header(name: &str) -> bool {
    !matches!(
        name,
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}
