//! [ntfy](https://ntfy.sh) push notifications.
//!
//! The body is sent as the raw request body; title, priority, tags and the
//! click-through link travel as headers.

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::{NotificationEvent, Severity};

use super::{check_status, parse_http_url, DeliveryError, NotificationBackend};

#[derive(Debug, Clone, Deserialize)]
pub struct NtfyConfig {
    /// Full topic URL, e.g. `https://ntfy.sh/my-sondes`.
    pub topic_url: String,
    /// Access token, sent as a bearer token.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Extra tags appended to the event-derived ones.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug)]
pub struct NtfyBackend {
    name: String,
    url: reqwest::Url,
    config: NtfyConfig,
    client: reqwest::Client,
}

impl NtfyBackend {
    pub fn new(
        name: String,
        config: NtfyConfig,
        client: reqwest::Client,
    ) -> Result<Self, DeliveryError> {
        let url = parse_http_url("topic_url", &config.topic_url)?;
        if config.token.is_some() && config.username.is_some() {
            return Err(DeliveryError::InvalidConfig(
                "ntfy: set either token or username/password, not both".into(),
            ));
        }
        if config.username.is_some() != config.password.is_some() {
            return Err(DeliveryError::InvalidConfig(
                "ntfy: username and password must be set together".into(),
            ));
        }
        Ok(Self {
            name,
            url,
            config,
            client,
        })
    }

    fn tags(&self, event: &NotificationEvent) -> String {
        let mut tags = vec!["balloon".to_string(), event.kind.as_str().to_string()];
        if event.record.last_observation.burst {
            tags.push("boom".to_string());
        }
        tags.extend(self.config.tags.iter().cloned());
        tags.join(",")
    }
}

/// ntfy priorities run from 1 (min) to 5 (max).
pub(crate) fn priority(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 2,
        Severity::Normal => 3,
        Severity::High => 5,
    }
}

#[async_trait]
impl NotificationBackend for NtfyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Title", &event.title)
            .header("Priority", priority(event.severity).to_string())
            .header("Tags", self.tags(event))
            .header("Click", event.tracking_url())
            .body(event.body.clone());

        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        } else if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request.send().await?;
        check_status(&response)?;
        tracing::debug!(backend = %self.name, serial = %event.serial, "ntfy message published");
        Ok(())
    }
}
