//! HTTP middleware: per-client rate limiting, CORS, and remembering
//! authenticated users.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, trace, warn};

use crate::auth::AuthUser;
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::routes::AppState;
use crate::webhooks::HEADER_WEBHOOK_SECRET;

// ============================================================================
// Constants
// ============================================================================

pub const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Key used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

// ============================================================================
// Rate Limiting
// ============================================================================

/// Body of a 429 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitedResponse {
    pub error: String,
    pub code: String,
    pub retry_after: u64,
}

/// Admits or rejects a request using the shared [`RateLimiter`], keyed by
/// client IP.
///
/// Paths listed in the rate limit config bypass the limiter. Every other
/// response carries the `X-RateLimit-*` headers; rejected requests get a
/// 429 with `Retry-After`.
///
/// [`RateLimiter`]: crate::rate_limit::RateLimiter
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if state.config.rate_limit.skip_paths.iter().any(|p| *p == path) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_ip(request.headers(), peer);

    let limiter = &state.rate_limiter;
    let allowed = limiter.allow(&client).await;
    let remaining = limiter.remaining(&client).await;
    let until_reset = limiter
        .reset_time(&client)
        .await
        .saturating_duration_since(Instant::now());

    if !allowed {
        let retry_after = ceil_secs(until_reset).max(1);
        info!(
            client_ip = %client,
            path = %path,
            retry_after,
            "Rate limit exceeded"
        );

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedResponse {
                error: "rate limit exceeded".to_string(),
                code: "rate_limited".to_string(),
                retry_after,
            }),
        )
            .into_response();
        set_limit_headers(response.headers_mut(), limiter.rate(), remaining, until_reset);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    trace!(client_ip = %client, remaining, "Request admitted");
    let mut response = next.run(request).await;
    set_limit_headers(response.headers_mut(), limiter.rate(), remaining, until_reset);
    response
}

fn ceil_secs(duration: std::time::Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn set_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    until_reset: std::time::Duration,
) {
    headers.insert(HEADER_RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(HEADER_RATE_LIMIT_REMAINING, HeaderValue::from(remaining));

    let reset_at = Utc::now()
        + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());
    if let Ok(value) = HeaderValue::from_str(&reset_at.to_rfc3339_opts(SecondsFormat::Secs, true))
    {
        headers.insert(HEADER_RATE_LIMIT_RESET, value);
    }
}

fn forwarded_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolves the client address used as the rate limit key.
///
/// Checks `X-Forwarded-For` (first hop), `X-Real-IP` and `CF-Connecting-IP`
/// in that order, then the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = forwarded_header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    forwarded_header(headers, "x-real-ip")
        .or_else(|| forwarded_header(headers, "cf-connecting-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

// ============================================================================
// Known Users
// ============================================================================

/// Stores the contact details of the authenticated caller.
///
/// Runs inside [`crate::auth::require_auth`], which provides the
/// [`AuthUser`] extension; requests without one pass through untouched.
pub async fn remember_user(
    State(devices): State<DeviceRegistry>,
    request: Request,
    next: Next,
) -> Response {
    let user = request.extensions().get::<AuthUser>().cloned();
    if let Some(user) = user {
        devices.remember_user(&user).await;
    }
    next.run(request).await
}

// ============================================================================
// CORS
// ============================================================================

/// CORS policy allowing the configured frontend origin with credentials.
///
/// An origin that is not a valid header value is logged and no cross-origin
/// requests are allowed.
pub fn cors_layer(config: &Config) -> CorsLayer {
    let origin = match HeaderValue::from_str(config.frontend_url.trim_end_matches('/')) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(err) => {
            warn!(
                frontend_url = %config.frontend_url,
                error = %err,
                "Invalid frontend URL, cross-origin requests disabled"
            );
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(HEADER_WEBHOOK_SECRET),
        ])
        .expose_headers([
            HeaderName::from_static(HEADER_RATE_LIMIT_LIMIT),
            HeaderName::from_static(HEADER_RATE_LIMIT_REMAINING),
            HeaderName::from_static(HEADER_RATE_LIMIT_RESET),
            header::RETRY_AFTER,
        ])
}

// ============================================================================
// Tests
// ============================================================================
