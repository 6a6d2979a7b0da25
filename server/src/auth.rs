//! Request authentication.
//!
//! Protected routes accept two kinds of credentials:
//!
//! 1. An HS256 API token, read from the configured cookie or from an
//!    `Authorization: Bearer <token>` header and validated locally.
//! 2. A session cookie from the external auth service, validated remotely
//!    through [`BetterAuthClient`] when no valid API token is present.
//!
//! [`require_auth`] is the axum middleware that enforces this. On success it
//! stores the [`AuthUser`] in the request extensions for handlers to extract.
//!
//! Webhook calls from the auth service are authenticated separately with a
//! shared secret, compared in constant time by [`verify_webhook_secret`].

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::better_auth::{BetterAuthClient, Session};
use crate::config::Config;
use crate::error::ErrorResponse;

/// Errors that can occur while authenticating a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The request carries neither an API token nor a session.
    #[error("missing credentials")]
    MissingCredentials,

    /// The API token is malformed or its signature does not match.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The API token is past its `exp` claim.
    #[error("token expired")]
    TokenExpired,

    /// The auth service did not confirm a session.
    #[error("session rejected: {0}")]
    SessionRejected(String),
}

impl AuthError {
    /// Creates an invalid token error.
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken(reason.into())
    }

    /// Returns `true` if the failure came from API token validation.
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::InvalidToken(_) | Self::TokenExpired)
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            _ => Self::InvalidToken(err.to_string()),
        }
    }
}

/// Claims carried by an API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub name: String,

    /// Session id the token was minted for.
    #[serde(default)]
    pub sid: String,

    /// Expiry as a unix timestamp.
    pub exp: u64,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            name: claims.name,
            email: claims.email,
        }
    }
}

impl From<Session> for AuthUser {
    fn from(session: Session) -> Self {
        Self {
            id: session.user.id,
            name: session.user.name,
            email: session.user.email,
        }
    }
}

/// Validates HS256 API tokens.
#[derive(Clone)]
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Decodes `token` and checks its signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExpired`] for expired tokens and
    /// [`AuthError::InvalidToken`] for anything else that fails validation.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Combined API token and session authenticator.
///
/// Cheap to clone; clones share the HTTP client of the session fallback.
#[derive(Debug, Clone)]
pub struct Authenticator {
    inner: Arc<AuthenticatorInner>,
}

#[derive(Debug)]
struct AuthenticatorInner {
    jwt: JwtValidator,
    cookie_name: String,
    sessions: Option<BetterAuthClient>,
}

impl Authenticator {
    /// Creates an authenticator.
    ///
    /// `sessions` enables the session fallback when no valid API token is
    /// present. With `None` only API tokens are accepted.
    pub fn new(
        jwt: JwtValidator,
        cookie_name: impl Into<String>,
        sessions: Option<BetterAuthClient>,
    ) -> Self {
        Self {
            inner: Arc::new(AuthenticatorInner {
                jwt,
                cookie_name: cookie_name.into(),
                sessions,
            }),
        }
    }

    /// Builds the authenticator described by `config`.
    ///
    /// If the session client cannot be created the fallback is disabled and
    /// a warning is logged.
    pub fn from_config(config: &Config) -> Self {
        let sessions = match BetterAuthClient::new(&config.better_auth_url) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(error = %err, "Session fallback disabled");
                None
            }
        };
        Self::new(
            JwtValidator::new(&config.jwt_secret),
            &config.jwt_cookie_name,
            sessions,
        )
    }

    /// Authenticates a request from its headers.
    ///
    /// # Errors
    ///
    /// Returns the reason the last attempted method failed.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let mut failure = AuthError::MissingCredentials;

        if let Some(token) = extract_token(headers, &self.inner.cookie_name) {
            match self.inner.jwt.validate(&token) {
                Ok(claims) => return Ok(claims.into()),
                Err(err) => {
                    debug!(error = %err, "API token rejected, trying session");
                    failure = err;
                }
            }
        }

        if let Some(sessions) = &self.inner.sessions {
            let cookie = header_str(headers, header::COOKIE.as_str());
            let authorization = header_str(headers, header::AUTHORIZATION.as_str());
            if cookie.is_some() || authorization.is_some() {
                return sessions
                    .get_session(cookie, authorization)
                    .await
                    .map(AuthUser::from)
                    .map_err(|err| AuthError::SessionRejected(err.to_string()));
            }
        }

        Err(failure)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Finds the API token in the named cookie or a bearer `Authorization` header.
///
/// The cookie wins when both are present.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string());

    from_cookie.or_else(|| {
        header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

/// Middleware rejecting unauthenticated requests with 401.
///
/// `OPTIONS` requests pass through untouched so CORS preflights work.
pub async fn require_auth(
    State(authenticator): State<Authenticator>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    match authenticator.authenticate(request.headers()).await {
        Ok(user) => {
            debug!(user_id = %user.id, "Request authenticated");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => {
            debug!(error = %err, path = %request.uri().path(), "Authentication failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("unauthorized")),
            )
                .into_response()
        }
    }
}

/// Checks a webhook secret in constant time.
///
/// With no `expected` secret configured every call is accepted.
pub fn verify_webhook_secret(provided: Option<&str>, expected: Option<&str>) -> bool {
    match (expected, provided) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(provided)) => {
            bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
        }
    }
}
