//! Transactional emails triggered by the auth service.
//!
//! [`EmailMessage`] constructors build the plain-text message for each kind
//! of notification. Delivery goes through the [`Mailer`] trait:
//! [`SmtpMailer`] hands messages to an SMTP relay, and [`LogMailer`] only
//! writes them to the log when no relay is configured.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::SmtpConfig;

/// Timeout for each SMTP command.
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Name used in greetings when the user has not set one.
const FALLBACK_NAME: &str = "there";

/// Errors returned by a [`Mailer`].
#[derive(Debug, Error)]
pub enum MailError {
    /// The recipient address is unusable.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The configured sender address is unusable.
    #[error("invalid sender: {0}")]
    InvalidSender(String),

    /// The transport could not be set up.
    #[error("mail transport setup failed: {0}")]
    Setup(String),

    /// The transport failed to hand the message off.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A rendered email ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

fn display_name(name: &str) -> &str {
    let name = name.trim();
    if name.is_empty() {
        FALLBACK_NAME
    } else {
        name
    }
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Passwordless sign-in link.
    pub fn magic_link(to: &str, url: &str) -> Self {
        Self::new(
            to,
            "Your sign-in link",
            format!(
                "Hi,\n\nuse the link below to sign in. It expires shortly and can only be used once.\n\n{url}\n\nIf you did not request this, you can ignore this email.\n"
            ),
        )
    }

    /// Email address verification link.
    pub fn verification(to: &str, name: &str, url: &str) -> Self {
        Self::new(
            to,
            "Verify your email address",
            format!(
                "Hi {},\n\nplease confirm your email address by opening this link:\n\n{url}\n",
                display_name(name)
            ),
        )
    }

    /// One-time code for two-factor sign-in.
    pub fn two_factor_otp(to: &str, name: &str, otp: &str) -> Self {
        Self::new(
            to,
            "Your security code",
            format!(
                "Hi {},\n\nyour security code is: {otp}\n\nDo not share this code with anyone.\n",
                display_name(name)
            ),
        )
    }

    /// Confirmation that two-factor authentication was turned on.
    pub fn two_factor_enabled(to: &str, name: &str, method: &str, settings_url: &str) -> Self {
        let method = if method.trim().is_empty() {
            "an authenticator app"
        } else {
            method.trim()
        };
        Self::new(
            to,
            "Two-factor authentication enabled",
            format!(
                "Hi {},\n\ntwo-factor authentication using {method} is now active on your account.\n\nIf this was not you, review your security settings: {settings_url}\n",
                display_name(name)
            ),
        )
    }

    /// Notice of a sign-in from a device not seen before.
    pub fn login_notification(
        to: &str,
        name: &str,
        device: &str,
        ip_address: &str,
        time: &str,
        settings_url: &str,
    ) -> Self {
        let ip_address = if ip_address.trim().is_empty() {
            "unknown"
        } else {
            ip_address.trim()
        };
        Self::new(
            to,
            "New sign-in from a new device",
            format!(
                "Hi {},\n\nwe noticed a sign-in to your account from a new device or location:\n\nDevice: {device}\nIP address: {ip_address}\nTime: {time}\n\nIf this was not you, review your active sessions: {settings_url}\n",
                display_name(name)
            ),
        )
    }

    /// Notice that a passkey was registered.
    pub fn passkey_added(
        to: &str,
        name: &str,
        passkey_name: &str,
        device: &str,
        settings_url: &str,
    ) -> Self {
        let passkey_name = if passkey_name.trim().is_empty() {
            "Passkey"
        } else {
            passkey_name.trim()
        };
        let device = if device.trim().is_empty() {
            "an unknown device"
        } else {
            device.trim()
        };
        Self::new(
            to,
            "New passkey added",
            format!(
                "Hi {},\n\nthe passkey \"{passkey_name}\" was added to your account from {device}.\n\nIf this was not you, remove it here: {settings_url}\n",
                display_name(name)
            ),
        )
    }
}

/// Email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends one message.
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Mailer that delivers through an SMTP relay.
///
/// STARTTLS is used when the relay offers it. Each message opens its own
/// connection.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    relay: String,
}

impl SmtpMailer {
    /// Builds a mailer for `smtp`, sending as `from`. No connection is made
    /// until the first message is sent.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::InvalidSender`] if `from` is not an address and
    /// [`MailError::Setup`] if TLS cannot be initialised.
    pub fn new(smtp: &SmtpConfig, from: &str) -> Result<Self, MailError> {
        let from: Mailbox = from
            .parse()
            .map_err(|_| MailError::InvalidSender(from.to_string()))?;
        let tls = TlsParameters::new(smtp.host.clone())
            .map_err(|err| MailError::Setup(err.to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp.host.as_str())
            .port(smtp.port)
            .tls(Tls::Opportunistic(tls))
            .timeout(Some(SMTP_TIMEOUT));
        if let Some((username, password)) = &smtp.credentials {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            relay: format!("{}:{}", smtp.host, smtp.port),
        })
    }
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("relay", &self.relay)
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|_| MailError::InvalidRecipient(message.to.clone()))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|err| MailError::Delivery(err.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|err| MailError::Delivery(err.to_string()))?;

        info!(
            relay = %self.relay,
            to = %message.to,
            subject = %message.subject,
            "Email delivered"
        );
        Ok(())
    }
}

/// Mailer that writes each message to the log instead of sending it.
#[derive(Debug, Clone)]
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        if !message.to.contains('@') {
            return Err(MailError::InvalidRecipient(message.to.clone()));
        }
        info!(
            from = %self.from,
            to = %message.to,
            subject = %message.subject,
            body_len = message.body.len(),
            "Email logged, no SMTP relay configured"
        );
        Ok(())
    }
}
