//! Notification backends.
//!
//! Each backend turns a [`NotificationEvent`] into one outbound call. Backends
//! do not retry; the [`Dispatcher`](crate::Dispatcher) owns retry, timeout
//! and cancellation so that every backend gets the same treatment.

pub mod discord;
pub mod email;
pub mod gotify;
pub mod log;
pub mod ntfy;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::NotificationEvent;

pub use discord::{DiscordBackend, DiscordConfig};
pub use email::{EmailBackend, EmailConfig, SmtpSecurity};
pub use gotify::{GotifyBackend, GotifyConfig};
pub use log::{LogBackend, LogConfig};
pub use ntfy::{NtfyBackend, NtfyConfig};
pub use webhook::{WebhookBackend, WebhookConfig};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The underlying HTTP request failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Backend returned HTTP {0}")]
    HttpStatus(u16),

    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),

    /// The call did not complete within the per-call timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The backend accepted the connection but refused the notification.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The backend could not be constructed from its configuration.
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A destination that can deliver notifications.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Stable name used in logs and delivery reports.
    fn name(&self) -> &str;

    /// Deliver one notification. A single attempt, no retry.
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// The closed set of built-in backends.
#[derive(Debug)]
pub enum Backend {
    Ntfy(NtfyBackend),
    Gotify(GotifyBackend),
    Discord(DiscordBackend),
    Webhook(WebhookBackend),
    Email(EmailBackend),
    Log(LogBackend),
}

#[async_trait]
impl NotificationBackend for Backend {
    fn name(&self) -> &str {
        match self {
            Backend::Ntfy(b) => b.name(),
            Backend::Gotify(b) => b.name(),
            Backend::Discord(b) => b.name(),
            Backend::Webhook(b) => b.name(),
            Backend::Email(b) => b.name(),
            Backend::Log(b) => b.name(),
        }
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        match self {
            Backend::Ntfy(b) => b.send(event).await,
            Backend::Gotify(b) => b.send(event).await,
            Backend::Discord(b) => b.send(event).await,
            Backend::Webhook(b) => b.send(event).await,
            Backend::Email(b) => b.send(event).await,
            Backend::Log(b) => b.send(event).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One `[[backends]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Overrides the default name (the backend kind).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: BackendKind,
}

fn default_enabled() -> bool {
    true
}

/// Backend-specific settings, selected by the `kind` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    Ntfy(NtfyConfig),
    Gotify(GotifyConfig),
    Discord(DiscordConfig),
    Webhook(WebhookConfig),
    Email(EmailConfig),
    Log(LogConfig),
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ntfy(_) => "ntfy",
            BackendKind::Gotify(_) => "gotify",
            BackendKind::Discord(_) => "discord",
            BackendKind::Webhook(_) => "webhook",
            BackendKind::Email(_) => "email",
            BackendKind::Log(_) => "log",
        }
    }
}

impl BackendConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    /// Construct the backend. HTTP backends share `client`.
    pub fn build(&self, client: &reqwest::Client) -> Result<Backend, DeliveryError> {
        let name = self.display_name();
        let backend = match &self.kind {
            BackendKind::Ntfy(c) => Backend::Ntfy(NtfyBackend::new(name, c.clone(), client.clone())?),
            BackendKind::Gotify(c) => {
                Backend::Gotify(GotifyBackend::new(name, c.clone(), client.clone())?)
            }
            BackendKind::Discord(c) => {
                Backend::Discord(DiscordBackend::new(name, c.clone(), client.clone())?)
            }
            BackendKind::Webhook(c) => {
                Backend::Webhook(WebhookBackend::new(name, c.clone(), client.clone())?)
            }
            BackendKind::Email(c) => Backend::Email(EmailBackend::new(name, c.clone())?),
            BackendKind::Log(c) => Backend::Log(LogBackend::new(name, c.clone())),
        };
        Ok(backend)
    }
}

/// Shared HTTP client for all HTTP backends.
pub fn http_client() -> Result<reqwest::Client, DeliveryError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("sondenotify/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Build every enabled backend, in configuration order.
///
/// Backend names must be unique so that logs and reports are unambiguous.
pub fn build_backends(configs: &[BackendConfig]) -> Result<Vec<Backend>, DeliveryError> {
    let client = http_client()?;
    let mut backends: Vec<Backend> = Vec::new();

    for config in configs.iter().filter(|c| c.enabled) {
        let backend = config.build(&client)?;
        if backends.iter().any(|b| b.name() == backend.name()) {
            return Err(DeliveryError::InvalidConfig(format!(
                "duplicate backend name `{}`",
                backend.name()
            )));
        }
        backends.push(backend);
    }

    Ok(backends)
}

/// Parse and check an http(s) endpoint URL.
pub(crate) fn parse_http_url(field: &str, raw: &str) -> Result<reqwest::Url, DeliveryError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| DeliveryError::InvalidConfig(format!("{field} `{raw}`: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(DeliveryError::InvalidConfig(format!(
            "{field} `{raw}`: unsupported scheme `{other}`"
        ))),
    }
}

/// Map a non-2xx response to [`DeliveryError::HttpStatus`].
pub(crate) fn check_status(response: &reqwest::Response) -> Result<(), DeliveryError> {
    if !response.status().is_success() {
        return Err(DeliveryError::HttpStatus(response.status().as_u16()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
