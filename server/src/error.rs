//! Error types for HTTP handlers.
//!
//! Handlers return [`ApiError`] for every failure that reaches the client.
//! It renders as a JSON body of the form
//! `{"error": "<message>", "code": "<machine readable code>"}` with the
//! matching status code.
//!
//! # Example
//!
//! ```rust,ignore
//! use ngp_server::error::ApiError;
//!
//! async fn handler() -> Result<Json<Thing>, ApiError> {
//!     let thing = lookup().ok_or_else(|| ApiError::not_found("thing not found"))?;
//!     Ok(Json(thing))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable message.
    pub error: String,

    /// Machine readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Errors returned by API handlers.
///
/// Each variant maps to a single HTTP status code. Client errors carry a
/// message that is safe to show to the caller. Internal errors are logged
/// and replaced with a generic message.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body or parameters are invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller is not authenticated.
    #[error("unauthorized")]
    Unauthorized,

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A dependency needed for this request is not running.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Unexpected server-side failure.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Creates a bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Creates a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a service unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable code placed in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::ServiceUnavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if this error is the caller's fault (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    fn body(&self) -> ErrorResponse {
        let message = match self {
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::ServiceUnavailable(msg) => {
                msg.clone()
            }
            Self::Unauthorized => "unauthorized".to_string(),
            Self::Internal(_) => "internal server error".to_string(),
        };
        ErrorResponse::new(message).with_code(self.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref detail) = self {
            error!(error = %detail, "Request failed with internal error");
        }
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Result type alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
