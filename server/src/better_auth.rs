//! Client for the external session authentication service.
//!
//! The frontend signs users in through a Better Auth deployment. Requests
//! that carry its session cookie instead of an API token are validated by
//! forwarding the cookie to `GET {base_url}/api/auth/get-session`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ngp_server::better_auth::BetterAuthClient;
//!
//! let client = BetterAuthClient::new("http://localhost:3000")?;
//! let session = client
//!     .get_session(Some("better-auth.session_token=abc"), None)
//!     .await?;
//! println!("signed in as {}", session.user.email);
//! ```

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

/// Timeout for session lookups.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the session endpoint relative to the base URL.
const GET_SESSION_PATH: &str = "/api/auth/get-session";

/// Errors that can occur when validating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The service rejected the credentials or reported no session.
    #[error("no valid session")]
    Unauthorized,

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service could not be reached.
    #[error("auth service unavailable: {0}")]
    Unavailable(String),

    /// The service answered with something we could not understand.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The HTTP client could not be built.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// The signed-in user as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// Session metadata as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
}

/// A validated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session: SessionInfo,
    pub user: SessionUser,
}

/// Response body of the session endpoint. Both fields are `null` when the
/// request carries no valid session.
#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Option<SessionInfo>,
    user: Option<SessionUser>,
}

/// HTTP client for the session endpoint.
#[derive(Debug, Clone)]
pub struct BetterAuthClient {
    http_client: Client,
    base_url: String,
}

impl BetterAuthClient {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SessionError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Base URL of the auth service.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Validates the caller's session by forwarding its credentials.
    ///
    /// `cookie` and `authorization` are the raw values of the incoming
    /// request's `Cookie` and `Authorization` headers.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Unauthorized`] - non-200 status or no session
    /// - [`SessionError::Timeout`] - the request took longer than 5 seconds
    /// - [`SessionError::Unavailable`] - the service is unreachable
    /// - [`SessionError::InvalidResponse`] - the body could not be parsed
    pub async fn get_session(
        &self,
        cookie: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Session, SessionError> {
        let url = format!("{}{}", self.base_url, GET_SESSION_PATH);
        debug!(url = %url, "Validating session with auth service");

        let mut request = self.http_client.get(&url);
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SessionError::Timeout(REQUEST_TIMEOUT)
            } else if e.is_connect() {
                SessionError::Unavailable(format!("connection failed: {e}"))
            } else {
                SessionError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            if status.is_server_error() {
                error!(status = %status, "Auth service returned an error");
            } else {
                debug!(status = %status, "Session rejected by auth service");
            }
            return Err(SessionError::Unauthorized);
        }

        let body: SessionResponse = response.json().await.map_err(|e| {
            SessionError::InvalidResponse(format!("failed to parse session response: {e}"))
        })?;

        match (body.session, body.user) {
            (Some(session), Some(user)) => {
                debug!(user_id = %user.id, "Session validated");
                Ok(Session { session, user })
            }
            _ => Err(SessionError::Unauthorized),
        }
    }
}
