//! Email notification delivery via SMTP.
//!
//! [`EmailBackend`] wraps the `lettre` async SMTP transport to send one
//! plain-text message per notification to every configured recipient.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use sondenotify_core::NotificationEvent;

use super::{DeliveryError, NotificationBackend};

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Connection security for the SMTP session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection. Only sensible for a local relay.
    None,
    #[default]
    Starttls,
    /// Implicit TLS, usually on port 465.
    Tls,
}

/// Configuration for the SMTP email backend.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (defaults to 587).
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub security: SmtpSecurity,
    /// RFC 5322 "From" address.
    pub from: String,
    /// One or more recipients.
    pub to: Vec<String>,
    /// Optional SMTP username.
    #[serde(default)]
    pub smtp_user: Option<String>,
    /// Optional SMTP password.
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// Prepended to every subject line.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_subject_prefix() -> String {
    "[sondenotify]".to_string()
}

// ---------------------------------------------------------------------------
// EmailBackend
// ---------------------------------------------------------------------------

/// Sends notification emails via SMTP.
#[derive(Debug)]
pub struct EmailBackend {
    name: String,
    config: EmailConfig,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailBackend {
    /// Parse addresses up front so a typo fails at startup, not at the first
    /// notification.
    pub fn new(name: String, config: EmailConfig) -> Result<Self, DeliveryError> {
        if config.smtp_host.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig("email: smtp_host is empty".into()));
        }
        if config.to.is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "email: at least one recipient is required".into(),
            ));
        }
        let from: Mailbox = config.from.parse()?;
        let to = config
            .to
            .iter()
            .map(|addr| addr.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            config,
            from,
            to,
        })
    }

    fn message(&self, event: &NotificationEvent) -> Result<Message, DeliveryError> {
        let subject = if self.config.subject_prefix.is_empty() {
            event.title.clone()
        } else {
            format!("{} {}", self.config.subject_prefix, event.title)
        };

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        builder
            .body(event.body.clone())
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let host = self.config.smtp_host.as_str();
        let mut transport_builder = match self.config.security {
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            SmtpSecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
        }
        .port(self.config.smtp_port);

        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(transport_builder.build())
    }
}

#[async_trait]
impl NotificationBackend for EmailBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let email = self.message(event)?;
        let mailer = self.transport()?;
        mailer.send(email).await?;

        tracing::debug!(
            backend = %self.name,
            recipients = self.to.len(),
            serial = %event.serial,
            "Notification email sent"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
