//! Server configuration module.
//!
//! Parses configuration from environment variables for the NGP API server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `ENVIRONMENT` | No | development | `production` makes `JWT_SECRET` mandatory |
//! | `FRONTEND_URL` | No | `http://localhost:3000` | Allowed CORS origin |
//! | `BETTER_AUTH_URL` | No | `FRONTEND_URL` | Session validation service |
//! | `JWT_SECRET` | Prod only | dev secret | HS256 secret for API tokens |
//! | `JWT_COOKIE_NAME` | No | `api-auth-token` | Cookie carrying the API token |
//! | `WEBHOOK_SECRET` | No | - | Expected `X-Webhook-Secret` value |
//! | `APP_URL` | No | `http://localhost:3000` | Base URL used in email links |
//! | `SMTP_HOST` | No | - | SMTP relay; emails are only logged when unset |
//! | `SMTP_PORT` | No | 1025 | SMTP relay port |
//! | `SMTP_USERNAME` | No | - | SMTP login, used together with `SMTP_PASSWORD` |
//! | `SMTP_PASSWORD` | No | - | SMTP password |
//! | `SMTP_FROM` | No | `noreply@localhost` | Sender address for emails |
//! | `RATE_LIMIT_REQUESTS` | No | 60 | Requests allowed per window and client |
//! | `RATE_LIMIT_WINDOW_SECS` | No | 60 | Rate limit window length |
//! | `JOBS_ENABLED` | No | true | Start the background job queue |
//! | `JOB_WORKERS` | No | 4 | Maximum concurrently running jobs |
//! | `JOB_MAX_ATTEMPTS` | No | 5 | Runs per job before it is given up |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default frontend origin.
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";

/// Secret used when `JWT_SECRET` is unset outside production.
const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";

/// Default name of the cookie holding the API token.
const DEFAULT_JWT_COOKIE_NAME: &str = "api-auth-token";

/// Default sender address.
const DEFAULT_SMTP_FROM: &str = "noreply@localhost";

/// Default SMTP relay port.
const DEFAULT_SMTP_PORT: u16 = 1025;

/// Default number of requests per rate limit window.
const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 60;

/// Default rate limit window length in seconds.
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default number of concurrently running jobs.
const DEFAULT_JOB_WORKERS: usize = 4;

/// Default number of runs per job, including the first.
const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 5;

/// Paths that never count against the rate limit.
pub const DEFAULT_RATE_LIMIT_SKIP_PATHS: [&str; 3] = ["/health", "/health/ready", "/health/live"];

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per client and window. Always greater than zero.
    pub requests_per_window: u32,

    /// Length of one fixed window.
    pub window: Duration,

    /// Request paths that bypass the limiter entirely.
    pub skip_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_RATE_LIMIT_REQUESTS,
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            skip_paths: DEFAULT_RATE_LIMIT_SKIP_PATHS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

/// SMTP relay settings.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Login as `(username, password)`, when the relay needs one.
    pub credentials: Option<(String, String)>,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "username",
                &self.credentials.as_ref().map(|(user, _)| user.as_str()),
            )
            .finish_non_exhaustive()
    }
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Deployment environment name (`development`, `production`, ...).
    pub environment: String,

    /// Origin of the web frontend, used for CORS.
    pub frontend_url: String,

    /// Base URL of the session authentication service.
    pub better_auth_url: String,

    /// HS256 secret used to validate API tokens.
    pub jwt_secret: String,

    /// Name of the cookie carrying the API token.
    pub jwt_cookie_name: String,

    /// Shared secret expected in `X-Webhook-Secret`. `None` accepts every call.
    pub webhook_secret: Option<String>,

    /// Public application URL used to build links in emails.
    pub app_url: String,

    /// SMTP relay. `None` logs emails instead of sending them.
    pub smtp: Option<SmtpConfig>,

    /// Sender address for outgoing emails.
    pub smtp_from: String,

    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,

    /// Whether the background job queue is started.
    pub jobs_enabled: bool,

    /// Maximum number of jobs running at once.
    pub job_workers: usize,

    /// Runs per job, including the first, before a failing job is dropped.
    pub job_max_attempts: u32,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `JWT_SECRET` is missing while `ENVIRONMENT=production`
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - Rate limit or worker settings are zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ngp_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let environment = env_or("ENVIRONMENT", "development");
        let frontend_url = env_or("FRONTEND_URL", DEFAULT_FRONTEND_URL);
        let better_auth_url = env_or("BETTER_AUTH_URL", &frontend_url);
        let is_production = environment.eq_ignore_ascii_case("production");

        let jwt_secret = match non_empty_env("JWT_SECRET") {
            Some(secret) => secret,
            None if is_production => {
                return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
            }
            None => {
                warn!("JWT_SECRET is not set - using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        let rate_limit = RateLimitConfig {
            requests_per_window: parse_env_or("RATE_LIMIT_REQUESTS", DEFAULT_RATE_LIMIT_REQUESTS)?,
            window: Duration::from_secs(parse_env_or(
                "RATE_LIMIT_WINDOW_SECS",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )?),
            ..RateLimitConfig::default()
        };

        let config = Self {
            port,
            environment,
            frontend_url,
            better_auth_url,
            jwt_secret,
            jwt_cookie_name: env_or("JWT_COOKIE_NAME", DEFAULT_JWT_COOKIE_NAME),
            webhook_secret: non_empty_env("WEBHOOK_SECRET"),
            app_url: env_or("APP_URL", DEFAULT_FRONTEND_URL),
            smtp: parse_smtp()?,
            smtp_from: env_or("SMTP_FROM", DEFAULT_SMTP_FROM),
            rate_limit,
            jobs_enabled: parse_bool_env("JOBS_ENABLED", true),
            job_workers: parse_env_or("JOB_WORKERS", DEFAULT_JOB_WORKERS)?,
            job_max_attempts: parse_env_or("JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS)?,
        };

        config.validate()?;

        if config.smtp.is_none() {
            warn!("SMTP_HOST is not set - emails are written to the log instead of sent");
        }

        if config.webhook_secret.is_none() {
            warn!("WEBHOOK_SECRET is not set - webhook endpoints accept unauthenticated calls");
        }

        Ok(config)
    }

    /// Returns `true` when running with `ENVIRONMENT=production`.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.requests_per_window == 0 {
            return Err(ConfigError::ValidationError(
                "RATE_LIMIT_REQUESTS must be greater than zero".to_string(),
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::ValidationError(
                "RATE_LIMIT_WINDOW_SECS must be greater than zero".to_string(),
            ));
        }

        if self.job_workers == 0 {
            return Err(ConfigError::ValidationError(
                "JOB_WORKERS must be greater than zero".to_string(),
            ));
        }

        if self.job_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "JOB_MAX_ATTEMPTS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    /// Development defaults, as produced by `from_env` with an empty environment.
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            better_auth_url: DEFAULT_FRONTEND_URL.to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_cookie_name: DEFAULT_JWT_COOKIE_NAME.to_string(),
            webhook_secret: None,
            app_url: DEFAULT_FRONTEND_URL.to_string(),
            smtp: None,
            smtp_from: DEFAULT_SMTP_FROM.to_string(),
            rate_limit: RateLimitConfig::default(),
            jobs_enabled: true,
            job_workers: DEFAULT_JOB_WORKERS,
            job_max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
        }
    }
}

/// Reads a variable, treating an empty value as unset.
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    non_empty_env(name).unwrap_or_else(|| default.to_string())
}

/// Parse a boolean environment variable.
///
/// Accepts `true`/`false` and `1`/`0` (case-insensitive). Anything else,
/// including an unset variable, yields `default`.
fn parse_bool_env(name: &str, default: bool) -> bool {
    match non_empty_env(name) {
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        _ => default,
    }
}

/// Parse a numeric environment variable, falling back to `default` when unset.
fn parse_env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_env(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        None => Ok(default),
    }
}

/// Reads the SMTP relay settings. Without `SMTP_HOST` there is no relay.
fn parse_smtp() -> Result<Option<SmtpConfig>, ConfigError> {
    let Some(host) = non_empty_env("SMTP_HOST") else {
        return Ok(None);
    };
    let port = parse_env_or("SMTP_PORT", DEFAULT_SMTP_PORT)?;

    let credentials = match (non_empty_env("SMTP_USERNAME"), non_empty_env("SMTP_PASSWORD")) {
        (Some(user), Some(password)) => Some((user, password)),
        (None, None) => None,
        _ => {
            return Err(ConfigError::ValidationError(
                "SMTP_USERNAME and SMTP_PASSWORD must be set together".to_string(),
            ));
        }
    };

    Ok(Some(SmtpConfig {
        host: host.trim().to_string(),
        port,
        credentials,
    }))
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
