//! Discord channel webhooks.

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::NotificationEvent;

use super::{check_status, parse_http_url, DeliveryError, NotificationBackend};

/// Discord rejects message content longer than this many characters.
const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
    /// Overrides the webhook's configured display name.
    #[serde(default)]
    pub username: Option<String>,
    /// Prepended to every message, e.g. `<@&1234>` to ping a role.
    #[serde(default)]
    pub mention: Option<String>,
}

#[derive(Debug)]
pub struct DiscordBackend {
    name: String,
    url: reqwest::Url,
    config: DiscordConfig,
    client: reqwest::Client,
}

impl DiscordBackend {
    pub fn new(
        name: String,
        config: DiscordConfig,
        client: reqwest::Client,
    ) -> Result<Self, DeliveryError> {
        let url = parse_http_url("webhook_url", &config.webhook_url)?;
        Ok(Self {
            name,
            url,
            config,
            client,
        })
    }

    fn content(&self, event: &NotificationEvent) -> String {
        let mut content = String::new();
        if let Some(mention) = &self.config.mention {
            content.push_str(mention);
            content.push(' ');
        }
        content.push_str(&format!("**{}**\n{}", event.title, event.body));
        truncate_chars(content, MAX_CONTENT_CHARS)
    }
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s,
    }
}

#[async_trait]
impl NotificationBackend for DiscordBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let mut payload = serde_json::json!({ "content": self.content(event) });
        if let Some(username) = &self.config.username {
            payload["username"] = username.clone().into();
        }

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;

        // 429 carries a Retry-After we do not honour.
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DeliveryError::Rejected("rate limited".into()));
        }
        check_status(&response)
    }
}
