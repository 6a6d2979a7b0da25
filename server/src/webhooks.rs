//! Webhooks called by the auth service to send transactional email.
//!
//! Every endpoint expects the shared secret in `X-Webhook-Secret` (when one
//! is configured) and a JSON body. Emails that sit on the sign-in path
//! (magic link, verification, OTP) go through the job queue when it is
//! running; security notifications are always sent directly.
//!
//! `session-created` sends a login notification only for sign-ins from a
//! device the [`DeviceRegistry`](crate::devices::DeviceRegistry) has not
//! seen for that user.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::auth::verify_webhook_secret;
use crate::devices::{describe_device, Contact, SessionInfo};
use crate::email::EmailMessage;
use crate::error::{ApiError, ApiResult, ErrorResponse};
use crate::jobs::Job;
use crate::routes::AppState;

/// Header carrying the shared webhook secret.
pub const HEADER_WEBHOOK_SECRET: &str = "x-webhook-secret";

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatedRequest {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub ip_address: String,
    /// Recipient, for users that have not called the API yet.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct VerificationEmailRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorOtpRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub otp: String,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorEnabledRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyAddedRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub passkey_name: String,
    #[serde(default)]
    pub device: String,
}

/// Body returned by every webhook on success.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
}

/// Routes mounted under `/webhooks`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session-created", post(session_created))
        .route("/send-magic-link", post(send_magic_link))
        .route("/send-verification-email", post(send_verification_email))
        .route("/send-2fa-otp", post(send_two_factor_otp))
        .route("/send-2fa-enabled", post(send_two_factor_enabled))
        .route("/send-passkey-added", post(send_passkey_added))
}

// ============================================================================
// Handlers
// ============================================================================

async fn session_created(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: SessionCreatedRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let session = SessionInfo {
        session_id: request.session_id,
        user_id: request.user_id,
        user_agent: request.user_agent,
        ip_address: request.ip_address,
    };
    if state.devices.record_session(&session).await {
        debug!(user_id = %session.user_id, "Sign-in from known device");
        return accepted("known device, notification skipped".to_string());
    }

    let contact = match request.email.filter(|email| !email.trim().is_empty()) {
        Some(email) => Some(Contact {
            email,
            name: request.name.unwrap_or_default(),
        }),
        None => state.devices.contact(&session.user_id).await,
    };
    let Some(contact) = contact else {
        warn!(user_id = %session.user_id, "User not found for session notification");
        return accepted("user not found".to_string());
    };

    let message = EmailMessage::login_notification(
        &contact.email,
        &contact.name,
        &describe_device(&session.user_agent),
        &session.ip_address,
        &Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        &settings_url(&state),
    );
    deliver(&state, message, "login notification", false).await
}

async fn send_magic_link(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: MagicLinkRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let message = EmailMessage::magic_link(&request.email, &request.url);
    deliver(&state, message, "magic link", true).await
}

async fn send_verification_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: VerificationEmailRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let message = EmailMessage::verification(&request.email, &request.name, &request.url);
    deliver(&state, message, "verification email", true).await
}

async fn send_two_factor_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: TwoFactorOtpRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let message = EmailMessage::two_factor_otp(&request.email, &request.name, &request.otp);
    deliver(&state, message, "2fa otp", true).await
}

async fn send_two_factor_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: TwoFactorEnabledRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let message = EmailMessage::two_factor_enabled(
        &request.email,
        &request.name,
        &request.method,
        &settings_url(&state),
    );
    deliver(&state, message, "2fa enabled notification", false).await
}

async fn send_passkey_added(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: PasskeyAddedRequest = match accept(&state, &headers, &body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let message = EmailMessage::passkey_added(
        &request.email,
        &request.name,
        &request.passkey_name,
        &request.device,
        &settings_url(&state),
    );
    deliver(&state, message, "passkey added notification", false).await
}

// ============================================================================
// Helpers
// ============================================================================

fn settings_url(state: &AppState) -> String {
    format!("{}/settings", state.config.app_url.trim_end_matches('/'))
}

/// Checks the webhook secret and decodes the body.
fn accept<T: DeserializeOwned>(state: &AppState, headers: &HeaderMap, body: &Bytes) -> ApiResult<T> {
    let provided = headers
        .get(HEADER_WEBHOOK_SECRET)
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_secret(provided, state.config.webhook_secret.as_deref()) {
        warn!("Webhook called with missing or wrong secret");
        return Err(ApiError::Unauthorized);
    }

    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "Failed to parse webhook body");
        ApiError::bad_request("invalid request body")
    })
}

/// Queues the email when allowed and a queue is running, else sends it now.
async fn deliver(state: &AppState, message: EmailMessage, kind: &str, queue: bool) -> Response {
    if queue {
        if let Some(jobs) = &state.jobs {
            let to = message.to.clone();
            return match jobs.enqueue(Job::SendEmail(message)) {
                Ok(()) => {
                    info!(kind, to = %to, "Email job enqueued");
                    accepted(format!("{kind} enqueued"))
                }
                Err(err) => {
                    error!(kind, error = %err, "Failed to enqueue email job");
                    failed("failed to enqueue email job")
                }
            };
        }
    }

    match state.mailer.send(&message).await {
        Ok(()) => {
            info!(kind, to = %message.to, "Email sent");
            accepted(format!("{kind} sent"))
        }
        Err(err) => {
            error!(kind, error = %err, "Failed to send email");
            failed("failed to send email")
        }
    }
}

fn accepted(message: String) -> Response {
    Json(WebhookResponse {
        success: true,
        message,
    })
    .into_response()
}

fn failed(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(message).with_code("email_failed")),
    )
        .into_response()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::broker::Broker;
    use crate::config::Config;
    use crate::email::testing::RecordingMailer;
    use crate::export::{ExportRunner, ExportStore};
    use crate::jobs::{JobContext, JobQueue};
    use crate::routes::create_router;

    fn state_with(secret: Option<&str>, mailer: Arc<RecordingMailer>) -> AppState {
        let config = Config {
            webhook_secret: secret.map(str::to_string),
            app_url: "https://app.example.com/".to_string(),
            ..Config::default()
        };
        AppState::new(config).with_mailer(mailer)
    }

    async fn call(
        state: AppState,
        path: &str,
        secret: Option<&str>,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/webhooks/{path}"))
            .header("Content-Type", "application/json");
        if let Some(secret) = secret {
            request = request.header(HEADER_WEBHOOK_SECRET, secret);
        }

        let response = create_router(state)
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn magic_link_is_sent_directly_without_queue() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(Some("s3cret"), mailer.clone());

        let (status, body) = call(
            state,
            "send-magic-link",
            Some("s3cret"),
            r#"{"email":"a@example.com","url":"https://app/login?t=1"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "magic link sent");

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("https://app/login?t=1"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(Some("s3cret"), mailer.clone());

        let (status, body) = call(
            state,
            "send-magic-link",
            Some("guess"),
            r#"{"email":"a@example.com","url":"u"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_rejected_when_configured() {
        let state = state_with(Some("s3cret"), Arc::new(RecordingMailer::default()));
        let (status, _) = call(
            state,
            "send-2fa-otp",
            None,
            r#"{"email":"a@example.com","otp":"1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn open_when_no_secret_configured() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(None, mailer.clone());

        let (status, body) = call(
            state,
            "send-2fa-otp",
            None,
            r#"{"email":"a@example.com","name":"Ada","otp":"424242"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "2fa otp sent");
        assert!(mailer.sent()[0].body.contains("424242"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let state = state_with(None, Arc::new(RecordingMailer::default()));
        let (status, body) = call(state, "send-verification-email", None, r#"{"email":1}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid request body");
    }

    #[tokio::test]
    async fn passkey_notice_links_to_settings() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(None, mailer.clone());

        let (status, body) = call(
            state,
            "send-passkey-added",
            None,
            r#"{"email":"a@example.com","name":"Ada","passkeyName":"YubiKey","device":"Firefox"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "passkey added notification sent");
        let sent = mailer.sent();
        assert!(sent[0].body.contains("\"YubiKey\""));
        assert!(sent[0].body.contains("https://app.example.com/settings"));
    }

    #[tokio::test]
    async fn delivery_failure_is_internal_error() {
        let state = state_with(None, Arc::new(RecordingMailer::default()))
            .with_mailer(Arc::new(crate::email::LogMailer::new("noreply@example.com")));

        let (status, body) = call(
            state,
            "send-2fa-enabled",
            None,
            r#"{"email":"not-an-address","method":"totp"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "failed to send email");
    }

    #[tokio::test]
    async fn configured_relay_receives_webhook_email() {
        let (smtp, relay) = crate::email::testing::fake_relay().await;
        let config = Config {
            smtp: Some(smtp),
            smtp_from: "noreply@example.com".to_string(),
            ..Config::default()
        };

        let (status, body) = call(
            AppState::new(config),
            "send-2fa-enabled",
            None,
            r#"{"email":"ada@example.com","name":"Ada","method":"totp"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "2fa enabled notification sent");

        let data = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay finished")
            .unwrap();
        assert!(data.contains("To: ada@example.com"));
        assert!(data.contains("Subject: Two-factor authentication enabled"));
    }

    #[tokio::test]
    async fn unreachable_relay_is_reported_as_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = Config {
            smtp: Some(crate::config::SmtpConfig {
                host: "127.0.0.1".to_string(),
                port,
                credentials: None,
            }),
            ..Config::default()
        };

        let (status, body) = call(
            AppState::new(config),
            "send-passkey-added",
            None,
            r#"{"email":"ada@example.com"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "failed to send email");
    }

    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

    fn session_body(session_id: &str, ip: &str) -> String {
        serde_json::json!({
            "sessionId": session_id,
            "userId": "user-1",
            "userAgent": FIREFOX,
            "ipAddress": ip,
        })
        .to_string()
    }

    #[tokio::test]
    async fn new_device_sign_in_notifies_known_user() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(None, mailer.clone());
        state
            .devices
            .remember_user(&crate::auth::AuthUser {
                id: "user-1".to_string(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
            })
            .await;

        let (status, body) = call(
            state,
            "session-created",
            None,
            &session_body("s1", "203.0.113.7"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "login notification sent");
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert!(sent[0].body.starts_with("Hi Ada,"));
        assert!(sent[0].body.contains("Device: Firefox on Linux"));
        assert!(sent[0].body.contains("IP address: 203.0.113.7"));
        assert!(sent[0].body.contains("https://app.example.com/settings"));
    }

    #[tokio::test]
    async fn known_device_sign_in_is_skipped() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(None, mailer.clone());
        let body = |session: &str| {
            serde_json::json!({
                "sessionId": session,
                "userId": "user-1",
                "userAgent": FIREFOX,
                "ipAddress": "203.0.113.7",
                "email": "ada@example.com",
            })
            .to_string()
        };

        let (_, first) = call(state.clone(), "session-created", None, &body("s1")).await;
        assert_eq!(first["message"], "login notification sent");

        let (status, second) = call(state, "session-created", None, &body("s2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["message"], "known device, notification skipped");
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_not_notified() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = state_with(None, mailer.clone());

        let (status, body) = call(
            state,
            "session-created",
            None,
            &session_body("s1", "203.0.113.7"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "user not found");
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn session_created_requires_secret() {
        let state = state_with(Some("s3cret"), Arc::new(RecordingMailer::default()));
        let (status, _) = call(
            state,
            "session-created",
            Some("nope"),
            &session_body("s1", "203.0.113.7"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sign_in_emails_use_the_queue_when_running() {
        let queued = Arc::new(RecordingMailer::default());
        let direct = Arc::new(RecordingMailer::default());
        let (queue, _worker) = JobQueue::start(
            JobContext {
                mailer: queued.clone(),
                exports: ExportRunner::new(Broker::new(), ExportStore::new()),
            },
            1,
        );
        let state = state_with(None, direct.clone()).with_job_queue(queue);

        let (status, body) = call(
            state.clone(),
            "send-verification-email",
            None,
            r#"{"email":"a@example.com","name":"Ada","url":"https://v"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "verification email enqueued");

        tokio::time::timeout(Duration::from_secs(5), async {
            while queued.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued email was not delivered");

        let (_, body) = call(
            state,
            "send-2fa-enabled",
            None,
            r#"{"email":"a@example.com","name":"Ada"}"#,
        )
        .await;
        assert_eq!(body["message"], "2fa enabled notification sent");
        assert_eq!(direct.sent().len(), 1);
        assert!(direct.sent()[0].body.contains("an authenticator app"));
    }
}
