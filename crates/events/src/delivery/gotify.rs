//! [Gotify](https://gotify.net) application messages.

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::{NotificationEvent, Severity};

use super::{check_status, parse_http_url, DeliveryError, NotificationBackend};

#[derive(Debug, Clone, Deserialize)]
pub struct GotifyConfig {
    /// Server base URL, e.g. `https://gotify.example.org`.
    pub url: String,
    pub app_token: String,
}

#[derive(Debug)]
pub struct GotifyBackend {
    name: String,
    message_url: reqwest::Url,
    app_token: String,
    client: reqwest::Client,
}

impl GotifyBackend {
    pub fn new(
        name: String,
        config: GotifyConfig,
        client: reqwest::Client,
    ) -> Result<Self, DeliveryError> {
        if config.app_token.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig("gotify: app_token is empty".into()));
        }
        let base = config.url.trim_end_matches('/');
        let message_url = parse_http_url("url", &format!("{base}/message"))?;
        Ok(Self {
            name,
            message_url,
            app_token: config.app_token,
            client,
        })
    }
}

/// Gotify priorities are 0..=10; 8 and above typically ring on Android.
fn priority(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 2,
        Severity::Normal => 5,
        Severity::High => 8,
    }
}

#[async_trait]
impl NotificationBackend for GotifyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "title": event.title,
            "message": event.body,
            "priority": priority(event.severity),
            "extras": {
                "client::notification": {
                    "click": { "url": event.tracking_url() }
                }
            }
        });

        let response = self
            .client
            .post(self.message_url.clone())
            .header("X-Gotify-Key", &self.app_token)
            .json(&payload)
            .send()
            .await?;
        check_status(&response)
    }
}
