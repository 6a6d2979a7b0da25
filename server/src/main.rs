//! NGP Server - Main entry point.
//!
//! This binary starts the API server with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background rate limiter sweep
//! - Optional background job queue for email and exports
//!
//! # Configuration
//!
//! See [`ngp_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development
//! cargo run --bin ngp-server
//!
//! # Production
//! ENVIRONMENT=production \
//! JWT_SECRET="change-me" \
//! WEBHOOK_SECRET="shared-secret" \
//! FRONTEND_URL="https://app.example.com" \
//! PORT=8080 \
//! cargo run --release --bin ngp-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use ngp_server::config::Config;
use ngp_server::jobs::{JobContext, JobQueue, RetryPolicy, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_DELAY};
use ngp_server::routes::{create_router, AppState};

/// How long to wait for running jobs after the server stops.
const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (production):");
            eprintln!("  JWT_SECRET              - HS256 secret for API tokens");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                    - HTTP server port (default: 8080)");
            eprintln!("  ENVIRONMENT             - development or production (default: development)");
            eprintln!("  FRONTEND_URL            - Allowed CORS origin (default: http://localhost:3000)");
            eprintln!("  BETTER_AUTH_URL         - Session service URL (default: FRONTEND_URL)");
            eprintln!("  JWT_COOKIE_NAME         - Cookie carrying the API token (default: api-auth-token)");
            eprintln!("  WEBHOOK_SECRET          - Shared secret for webhook calls (default: unset)");
            eprintln!("  APP_URL                 - Base URL used in email links");
            eprintln!("  SMTP_HOST               - SMTP relay host (default: unset, emails are logged)");
            eprintln!("  SMTP_PORT               - SMTP relay port (default: 1025)");
            eprintln!("  SMTP_USERNAME           - SMTP login (requires SMTP_PASSWORD)");
            eprintln!("  SMTP_PASSWORD           - SMTP password (requires SMTP_USERNAME)");
            eprintln!("  SMTP_FROM               - Sender address (default: noreply@localhost)");
            eprintln!("  RATE_LIMIT_REQUESTS     - Requests per window (default: 60)");
            eprintln!("  RATE_LIMIT_WINDOW_SECS  - Window length in seconds (default: 60)");
            eprintln!("  JOBS_ENABLED            - Start the background job queue (default: true)");
            eprintln!("  JOB_WORKERS             - Concurrent background jobs (default: 4)");
            eprintln!("  JOB_MAX_ATTEMPTS        - Runs per job before giving up (default: 5)");
            eprintln!("  RUST_LOG                - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        environment = %config.environment,
        frontend_url = %config.frontend_url,
        rate_limit = config.rate_limit.requests_per_window,
        rate_window_secs = config.rate_limit.window.as_secs(),
        webhook_secret = config.webhook_secret.is_some(),
        smtp = config.smtp.is_some(),
        "NGP server starting"
    );

    let mut state = AppState::new(config.clone());

    let mut sweeper = state.rate_limiter.start_sweeper();
    info!(
        interval_secs = (state.rate_limiter.window() * 5).as_secs(),
        "Rate limiter sweeper started"
    );

    let mut worker = None;
    if config.jobs_enabled {
        let context = JobContext {
            mailer: state.mailer.clone(),
            exports: state.export_runner(),
        };
        let (queue, handle) = JobQueue::start_with(
            context,
            config.job_workers,
            DEFAULT_QUEUE_CAPACITY,
            RetryPolicy::new(config.job_max_attempts, DEFAULT_RETRY_DELAY),
        );
        state = state.with_job_queue(queue);
        worker = Some(handle);
    } else {
        warn!("Background jobs disabled, emails are sent inline and exports are unavailable");
    }

    let broker = state.broker.clone();
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // SSE responses never finish on their own.
        broker.disconnect_all();
    });

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    sweeper.stop();
    info!("Rate limiter sweeper stopped");

    // The router and every queue handle it held are gone, so the worker
    // finishes its running jobs and exits.
    if let Some(worker) = worker {
        match tokio::time::timeout(JOB_SHUTDOWN_TIMEOUT, worker).await {
            Ok(Ok(())) => info!("Job queue drained"),
            Ok(Err(err)) => error!(error = %err, "Job worker panicked"),
            Err(_) => warn!(
                timeout_secs = JOB_SHUTDOWN_TIMEOUT.as_secs(),
                "Timed out waiting for background jobs"
            ),
        }
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info`, with request traces
/// from `tower_http` at debug).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
