use std::fmt;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{Error, ErrorDetails};
use crate::plan::PlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated caller on whose behalf a request runs.
///
/// Resolved once per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_active: bool,
    pub plan_id: Option<PlanId>,
    pub is_admin: bool,
}

fn default_true() -> bool {
    true
}

/// Access-token claims as issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Resolves bearer tokens into principals.
#[derive(Clone)]
pub struct Auth {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Auth {
    pub fn new(secret: &SecretString, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, Error> {
        let secret = std::env::var(&config.jwt_secret_env).map_err(|_| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Environment variable `{}` must hold the JWT signing secret",
                    config.jwt_secret_env
                ),
            })
        })?;
        if secret.is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("Environment variable `{}` is empty", config.jwt_secret_env),
            }));
        }
        Ok(Self::new(
            &SecretString::from(secret),
            config.issuer.as_deref(),
        ))
    }

    /// Decode and validate `token`. Fails with `Unauthenticated` for bad
    /// tokens; inactive users still resolve, with `is_active` unset.
    pub fn resolve(&self, token: &str) -> Result<Principal, Error> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                Error::new(ErrorDetails::Unauthenticated {
                    message: format!("Invalid access token: {e}"),
                })
            })?
            .claims;
        let user_id = claims.sub.parse::<u64>().map(UserId).map_err(|_| {
            Error::new(ErrorDetails::Unauthenticated {
                message: format!("Token subject `{}` is not a user id", claims.sub),
            })
        })?;

        Ok(Principal {
            user_id,
            is_active: claims.active,
            plan_id: claims.plan_id,
            is_admin: claims.admin,
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, Error> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            Error::new(ErrorDetails::Unauthenticated {
                message: "Missing authorization header".to_string(),
            })
        })?
        .to_str()
        .map_err(|_| {
            Error::new(ErrorDetails::Unauthenticated {
                message: "Authorization header is not valid ASCII".to_string(),
            })
        })?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(Error::new(ErrorDetails::Unauthenticated {
            message: "Authorization header must use the Bearer scheme".to_string(),
        })),
    }
}

/// Authenticate without metering: resolves the [`Principal`] and stores it in
/// the request extensions. Used on the `/usage` routes, which inactive users
/// may not read.
pub async fn require_principal(
    State(auth): State<Auth>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let principal = auth.resolve(extract_bearer_token(request.headers())?)?;
    if !principal.is_active {
        return Err(Error::new(ErrorDetails::InactivePrincipal {
            user_id: principal.user_id,
        }));
    }
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Gate for operator endpoints.
pub fn require_admin(principal: &Principal) -> Result<(), Error> {
    if principal.is_admin {
        Ok(())
    } else {
        Err(Error::new(ErrorDetails::PermissionDenied {
            message: format!("User {} is not an administrator", principal.user_id),
        }))
    }
}
