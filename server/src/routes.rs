//! HTTP route handlers for the NGP API server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /health`, `/health/ready`, `/health/live` - Health checks
//! - `GET /api/v1/events` - Server-Sent Events stream
//! - `POST /api/v1/trigger-update` - Broadcast a manual `stats-updated` event
//! - `GET|POST /api/v1/stats` - Per-user dashboard counters (authenticated)
//! - `POST /api/v1/export/start`, `GET /api/v1/export/download/{id}` - Data exports
//! - `POST /api/v1/webhooks/*` - Email webhooks for the auth service
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The event broker feeding SSE clients
//! - The rate limiter used by the admission middleware
//! - Authentication, stats, export and device stores, the mailer and job queue
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use ngp_server::routes::{create_router, AppState};
//! use ngp_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderValue},
    middleware::from_fn_with_state,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::auth::{require_auth, AuthUser, Authenticator};
use crate::broker::Broker;
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::email::{LogMailer, Mailer, SmtpMailer};
use crate::error::{ApiError, ApiResult};
use crate::export::{ExportDataType, ExportFormat, ExportJob, ExportRunner, ExportStore};
use crate::jobs::{Job, JobQueue};
use crate::middleware::{cors_layer, enforce_rate_limit, remember_user};
use crate::rate_limit::RateLimiter;
use crate::stats::{StatField, StatsStore, UserStats};
use crate::webhooks;

// ============================================================================
// Constants
// ============================================================================

/// SSE event sent when dashboard numbers change.
pub const STATS_UPDATED_EVENT: &str = "stats-updated";

/// First SSE frame of every stream.
const CONNECTED_EVENT: &str = "connected";
const CONNECTED_DATA: &str = r#"{"status":"ok"}"#;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Every field is a cheap-to-clone handle, so the state is cloned into each
/// request handler.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Event broker feeding SSE clients.
    pub broker: Broker,

    /// Per-client admission control.
    pub rate_limiter: RateLimiter,

    /// Validates API tokens and sessions.
    pub authenticator: Authenticator,

    /// Per-user dashboard counters.
    pub stats: StatsStore,

    /// Finished exports waiting for download.
    pub exports: ExportStore,

    /// Known users and their sign-in devices.
    pub devices: DeviceRegistry,

    /// Email transport used for direct sends.
    pub mailer: Arc<dyn Mailer>,

    /// Background job queue; `None` when jobs are disabled.
    pub jobs: Option<JobQueue>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from the configuration.
    ///
    /// The job queue is not started here; see [`AppState::with_job_queue`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit.requests_per_window,
            config.rate_limit.window,
        );
        Self::with_components(config, Broker::new(), rate_limiter)
    }

    /// Creates application state with a custom broker and rate limiter.
    #[must_use]
    pub fn with_components(config: Config, broker: Broker, rate_limiter: RateLimiter) -> Self {
        Self {
            authenticator: Authenticator::from_config(&config),
            mailer: mailer_for(&config),
            config: Arc::new(config),
            broker,
            rate_limiter,
            stats: StatsStore::new(),
            exports: ExportStore::new(),
            devices: DeviceRegistry::new(),
            jobs: None,
            start_time: Instant::now(),
        }
    }

    /// Replaces the email transport.
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Attaches a running job queue.
    #[must_use]
    pub fn with_job_queue(mut self, jobs: JobQueue) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Export runner publishing through this state's broker and store.
    pub fn export_runner(&self) -> ExportRunner {
        ExportRunner::new(self.broker.clone(), self.exports.clone())
    }
}

/// SMTP delivery when a relay is configured, the log otherwise.
fn mailer_for(config: &Config) -> Arc<dyn Mailer> {
    let Some(smtp) = &config.smtp else {
        return Arc::new(LogMailer::new(config.smtp_from.clone()));
    };
    match SmtpMailer::new(smtp, &config.smtp_from) {
        Ok(mailer) => {
            info!(host = %smtp.host, port = smtp.port, "Sending email through SMTP relay");
            Arc::new(mailer)
        }
        Err(err) => {
            error!(error = %err, "Cannot use SMTP relay, emails will only be logged");
            Arc::new(LogMailer::new(config.smtp_from.clone()))
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("broker", &self.broker)
            .field("rate_limiter", &self.rate_limiter)
            .field("jobs", &self.jobs.is_some())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes and middleware.
///
/// Layers, outermost first: request tracing, CORS, rate limiting. Routes
/// that need a user are additionally wrapped in [`require_auth`], inside
/// which the caller's contact details are remembered.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/protected/hello", get(get_protected_hello))
        .route("/me", get(get_me))
        .route("/stats", get(get_stats).post(post_stats))
        .route("/export/start", post(post_export_start))
        .route_layer(from_fn_with_state(state.devices.clone(), remember_user))
        .route_layer(from_fn_with_state(
            state.authenticator.clone(),
            require_auth,
        ));

    let api = Router::new()
        .route("/hello", get(get_hello))
        .route("/events", get(get_events))
        .route("/trigger-update", post(post_trigger_update))
        .route("/export/download/{id}", get(get_export_download))
        .merge(protected)
        .nest("/webhooks", webhooks::router());

    Router::new()
        .route("/health", get(get_health))
        .route("/health/ready", get(get_ready))
        .route("/health/live", get(get_live))
        .nest("/api/v1", api)
        .layer(from_fn_with_state(state.clone(), enforce_rate_limit))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Response Types
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Crate version.
    pub version: String,

    /// Number of connected SSE clients.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Body of `POST /api/v1/stats`.
#[derive(Debug, Deserialize)]
pub struct UpdateStatsRequest {
    pub field: String,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

fn default_delta() -> i64 {
    1
}

/// Body of `POST /api/v1/export/start`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExportRequest {
    pub format: String,
    pub data_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExportResponse {
    pub job_id: String,
    pub message: String,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "Failed to parse request body");
        ApiError::bad_request("invalid request body")
    })
}

// ============================================================================
// Health
// ============================================================================

/// GET /health - Health check endpoint.
///
/// ```json
/// {
///   "status": "ok",
///   "version": "0.1.0",
///   "connections": 3,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.broker.client_count().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_ready() -> &'static str {
    "Ready"
}

async fn get_live() -> &'static str {
    "Alive"
}

// ============================================================================
// Hello / Me
// ============================================================================

async fn get_hello() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Hello from the API!".to_string(),
    })
}

async fn get_protected_hello(Extension(user): Extension<AuthUser>) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: format!("Hello {}! You are authenticated.", user.name),
    })
}

async fn get_me(Extension(user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(user)
}

// ============================================================================
// GET /api/v1/events - Server-Sent Events
// ============================================================================

/// GET /api/v1/events - SSE stream.
///
/// A subscription is held for the lifetime of the response. The first frame
/// is `connected`; after that every broadcast event is forwarded as
/// `event: <type>` / `data: <data>`. When the client goes away the stream is
/// dropped, which unsubscribes.
async fn get_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.broker.subscribe();
    info!(subscriber_id = %subscription.id(), "SSE client connected");

    let connected = stream::once(async {
        Ok(SseEvent::default()
            .event(CONNECTED_EVENT)
            .data(CONNECTED_DATA))
    });

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = SseEvent::default()
            .event(event.event_type)
            .data(event.data);
        Some((Ok(frame), subscription))
    });

    Sse::new(connected.chain(events))
}

/// POST /api/v1/trigger-update - Broadcast a manual stats refresh.
async fn post_trigger_update(State(state): State<AppState>) -> Json<StatusResponse> {
    state
        .broker
        .broadcast(STATS_UPDATED_EVENT, r#"{"trigger":"manual"}"#);
    info!("Manual stats update broadcast");

    Json(StatusResponse {
        status: "broadcast sent".to_string(),
    })
}

// ============================================================================
// Stats
// ============================================================================

async fn get_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Json<UserStats> {
    Json(state.stats.get_or_create(&user.id).await)
}

/// POST /api/v1/stats - Adjust one counter and notify SSE clients.
async fn post_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<UserStats>> {
    let request: UpdateStatsRequest = parse_body(&body)?;
    let field: StatField = request.field.parse().map_err(ApiError::bad_request)?;

    let stats = state.stats.increment(&user.id, field, request.delta).await;
    debug!(user_id = %user.id, field = %field, delta = request.delta, "Stats updated");

    let payload = serde_json::json!({
        "trigger": "update",
        "userId": user.id,
        "field": field,
    });
    state.broker.broadcast(STATS_UPDATED_EVENT, payload.to_string());

    Ok(Json(stats))
}

// ============================================================================
// Export
// ============================================================================

/// POST /api/v1/export/start - Queue a data export.
///
/// Progress is reported through `export-progress` SSE events.
async fn post_export_start(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<StartExportResponse>> {
    let request: StartExportRequest = parse_body(&body)?;
    let format: ExportFormat = request.format.parse().map_err(ApiError::bad_request)?;
    let data_type: ExportDataType = request.data_type.parse().map_err(ApiError::bad_request)?;

    let jobs = state
        .jobs
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("export service is currently unavailable"))?;

    let job = ExportJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        format,
        data_type,
    };
    let job_id = job.job_id.clone();

    jobs.enqueue(Job::DataExport(job)).map_err(|err| {
        error!(job_id = %job_id, error = %err, "Failed to enqueue export job");
        ApiError::internal(format!("enqueue export {job_id}: {err}"))
    })?;

    info!(
        job_id = %job_id,
        user_id = %user.id,
        format = format.extension(),
        data_type = %data_type,
        "Export job enqueued"
    );

    Ok(Json(StartExportResponse {
        job_id,
        message: "Export started".to_string(),
    }))
}

/// GET /api/v1/export/download/{id} - Download a finished export.
async fn get_export_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let export = state
        .exports
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found("export not found or expired"))?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        export.file_name
    ))
    .map_err(|err| ApiError::internal(format!("content disposition: {err}")))?;
    let content_type = HeaderValue::from_str(&export.content_type)
        .map_err(|err| ApiError::internal(format!("content type: {err}")))?;

    info!(download_id = %id, file_name = %export.file_name, "Export downloaded");

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.data,
    )
        .into_response())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::auth::Claims;
    use crate::email::testing::RecordingMailer;
    use crate::export::{ExportProgress, ExportStatus, EXPORT_PROGRESS_EVENT};
    use crate::jobs::JobContext;

    const SECRET: &str = "test-secret";

    fn test_config() -> Config {
        Config {
            jwt_secret: SECRET.to_string(),
            // Nothing listens here; session fallback fails fast.
            better_auth_url: "http://127.0.0.1:9".to_string(),
            ..Config::default()
        }
    }

    fn token_for(user_id: &str, name: &str) -> String {
        let exp = chrono::Utc::now().timestamp() as u64 + 3600;
        let claims = Claims {
            sub: user_id.to_string(),
            email: format!("{user_id}@example.com"),
            name: name.to_string(),
            sid: "session-1".to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ========================================================================
    // Health endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = create_router(AppState::new(test_config()));
        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse =
            serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn health_counts_sse_clients() {
        let state = AppState::new(test_config());
        let _subscription = state.broker.subscribe();

        let response = create_router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(json_body(response).await["connections"], 1);
    }

    #[tokio::test]
    async fn readiness_and_liveness() {
        let app = create_router(AppState::new(test_config()));

        let ready = app.clone().oneshot(get("/health/ready")).await.unwrap();
        let bytes = axum::body::to_bytes(ready.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Ready");

        let live = app.oneshot(get("/health/live")).await.unwrap();
        let bytes = axum::body::to_bytes(live.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Alive");
    }

    #[tokio::test]
    async fn health_is_not_rate_limited() {
        let mut config = test_config();
        config.rate_limit.requests_per_window = 1;
        let app = create_router(AppState::new(config));

        for _ in 0..3 {
            let response = app.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    // ========================================================================
    // Public API tests
    // ========================================================================

    #[tokio::test]
    async fn public_hello() {
        let app = create_router(AppState::new(test_config()));
        let response = app.oneshot(get("/api/v1/hello")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        assert_eq!(json_body(response).await["message"], "Hello from the API!");
    }

    #[tokio::test]
    async fn trigger_update_broadcasts_stats_event() {
        let state = AppState::new(test_config());
        let mut subscription = state.broker.subscribe();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/trigger-update")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "broadcast sent");

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.event_type, STATS_UPDATED_EVENT);
        assert_eq!(event.data, r#"{"trigger":"manual"}"#);
    }

    #[tokio::test]
    async fn events_endpoint_streams_sse() {
        let state = AppState::new(test_config());
        let broker = state.broker.clone();

        let response = create_router(state).oneshot(get("/api/v1/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(broker.client_count().await, 1);

        drop(response);
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.client_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscription should be released with the response");
    }

    #[tokio::test]
    async fn unknown_download_is_not_found() {
        let app = create_router(AppState::new(test_config()));
        let response = app
            .oneshot(get("/api/v1/export/download/nope"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "export not found or expired");
    }

    // ========================================================================
    // Protected API tests
    // ========================================================================

    #[tokio::test]
    async fn protected_routes_require_auth() {
        let app = create_router(AppState::new(test_config()));

        for uri in ["/api/v1/protected/hello", "/api/v1/me", "/api/v1/stats"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(json_body(response).await["error"], "unauthorized");
        }
    }

    #[tokio::test]
    async fn protected_hello_greets_user() {
        let app = create_router(AppState::new(test_config()));
        let token = token_for("user-1", "Ada");

        let response = app
            .oneshot(authed("GET", "/api/v1/protected/hello", &token, ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await["message"],
            "Hello Ada! You are authenticated."
        );
    }

    #[tokio::test]
    async fn authenticated_requests_remember_the_caller() {
        let state = AppState::new(test_config());
        let devices = state.devices.clone();
        let app = create_router(state);

        let response = app
            .oneshot(authed("GET", "/api/v1/me", &token_for("user-9", "Ada"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let contact = devices.contact("user-9").await.unwrap();
        assert_eq!(contact.email, "user-9@example.com");
        assert_eq!(contact.name, "Ada");
    }

    #[tokio::test]
    async fn me_returns_token_user() {
        let app = create_router(AppState::new(test_config()));
        let token = token_for("user-1", "Ada");

        let response = app
            .oneshot(authed("GET", "/api/v1/me", &token, ""))
            .await
            .unwrap();
        let user: AuthUser = serde_json::from_value(json_body(response).await).unwrap();

        assert_eq!(user.id, "user-1");
        assert_eq!(user.email, "user-1@example.com");
    }

    #[tokio::test]
    async fn stats_update_adjusts_counter_and_broadcasts() {
        let state = AppState::new(test_config());
        let mut subscription = state.broker.subscribe();
        let app = create_router(state);
        let token = token_for("user-1", "Ada");

        let response = app
            .clone()
            .oneshot(authed("GET", "/api/v1/stats", &token, ""))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["projectCount"], 3);

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/stats",
                &token,
                r#"{"field":"projects","delta":2}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["projectCount"], 5);

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.event_type, STATS_UPDATED_EVENT);
        let payload: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(payload["field"], "projects");
        assert_eq!(payload["userId"], "user-1");
    }

    #[tokio::test]
    async fn stats_update_rejects_unknown_field() {
        let app = create_router(AppState::new(test_config()));
        let token = token_for("user-1", "Ada");

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/stats",
                &token,
                r#"{"field":"karma","delta":1}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn export_start_without_queue_is_unavailable() {
        let app = create_router(AppState::new(test_config()));
        let token = token_for("user-1", "Ada");

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/export/start",
                &token,
                r#"{"format":"csv","dataType":"stats"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn export_start_validates_format() {
        let app = create_router(AppState::new(test_config()));
        let token = token_for("user-1", "Ada");

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/export/start",
                &token,
                r#"{"format":"xml","dataType":"stats"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_runs_and_can_be_downloaded() {
        let state = AppState::new(test_config());
        let (queue, _worker) = JobQueue::start(
            JobContext {
                mailer: Arc::new(RecordingMailer::default()),
                exports: state.export_runner().with_step_delay(Duration::ZERO),
            },
            1,
        );
        let state = state.with_job_queue(queue);
        let mut subscription = state.broker.subscribe();
        let app = create_router(state);
        let token = token_for("user-1", "Ada");

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/v1/export/start",
                &token,
                r#"{"format":"csv","dataType":"activity"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = json_body(response).await["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let done = loop {
            let event = subscription.recv().await.unwrap();
            assert_eq!(event.event_type, EXPORT_PROGRESS_EVENT);
            let progress: ExportProgress = serde_json::from_str(&event.data).unwrap();
            assert_eq!(progress.job_id, job_id);
            if progress.status == ExportStatus::Completed {
                break progress;
            }
        };

        let download_id = done.download_id.unwrap();
        let response = app
            .oneshot(get(&format!("/api/v1/export/download/{download_id}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/csv");
        let disposition = response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"export_activity_"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let csv = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(csv.starts_with("action,details,timestamp\n"));
    }
}
