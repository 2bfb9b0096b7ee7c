use std::fmt::{Debug, Display};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::plan::PlanId;
use crate::principal::UserId;

/// Controls whether error bodies carry the `Debug` rendering of wrapped values.
///
/// Set once at startup from `[gateway] debug`. Defaults to `false`.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *DEBUG.get().unwrap_or(&false) {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// The inner value stays private so every error goes through `Error::new` and gets logged.
// Boxed per `clippy::result_large_err`.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(*self.0, ErrorDetails::StoreUnavailable { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    DurableStore {
        message: String,
    },
    InactivePrincipal {
        user_id: UserId,
    },
    InternalError {
        message: String,
    },
    InvalidPeriodKey {
        key: String,
    },
    NoPlanAssigned {
        user_id: UserId,
        plan_id: Option<PlanId>,
    },
    Observability {
        message: String,
    },
    PermissionDenied {
        message: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
    Unauthenticated {
        message: String,
    },
    Upstream {
        message: String,
    },
    UpstreamNotConfigured,
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::DurableStore { .. } => tracing::Level::ERROR,
            ErrorDetails::InactivePrincipal { .. } => tracing::Level::INFO,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidPeriodKey { .. } => tracing::Level::WARN,
            ErrorDetails::NoPlanAssigned { .. } => tracing::Level::INFO,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PermissionDenied { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::Unauthenticated { .. } => tracing::Level::DEBUG,
            ErrorDetails::Upstream { .. } => tracing::Level::ERROR,
            ErrorDetails::UpstreamNotConfigured => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::DurableStore { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InactivePrincipal { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidPeriodKey { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::NoPlanAssigned { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::UpstreamNotConfigured => StatusCode::NOT_FOUND,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::DurableStore { message } => {
                write!(f, "Durable usage store error: {message}")
            }
            ErrorDetails::InactivePrincipal { user_id } => {
                write!(f, "User {user_id} is inactive")
            }
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidPeriodKey { key } => {
                write!(
                    f,
                    "Invalid period key `{key}`: expected `YYYY-MM-DD` or `YYYY-MM`"
                )
            }
            ErrorDetails::NoPlanAssigned { user_id, plan_id } => match plan_id {
                Some(plan_id) => write!(
                    f,
                    "User {user_id} is assigned to plan {plan_id}, which is unknown or inactive"
                ),
                None => write!(f, "User {user_id} has no plan assigned"),
            },
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::PermissionDenied { message } => {
                write!(f, "Permission denied: {message}")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Counter store unavailable: {message}")
            }
            ErrorDetails::Unauthenticated { message } => {
                write!(f, "Unauthenticated: {message}")
            }
            ErrorDetails::Upstream { message } => write!(f, "Upstream request failed: {message}"),
            ErrorDetails::UpstreamNotConfigured => {
                write!(f, "No upstream application is configured for `/api` routes")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    fn to_response_json(&self) -> (StatusCode, Value) {
        let body = json!({"error": self.to_string()});
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
