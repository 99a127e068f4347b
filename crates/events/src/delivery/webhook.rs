//! Generic JSON webhook delivery.
//!
//! [`WebhookBackend`] POSTs a JSON description of the notification, including
//! the full sonde record, to an arbitrary URL. Optional static headers allow
//! simple shared-secret authentication.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::NotificationEvent;

use super::{check_status, parse_http_url, DeliveryError, NotificationBackend};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Extra request headers, e.g. `{ Authorization = "Bearer ..." }`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// WebhookBackend
// ---------------------------------------------------------------------------

/// Delivers notifications to an external webhook endpoint.
#[derive(Debug)]
pub struct WebhookBackend {
    name: String,
    url: reqwest::Url,
    headers: reqwest::header::HeaderMap,
    client: reqwest::Client,
}

impl WebhookBackend {
    pub fn new(
        name: String,
        config: WebhookConfig,
        client: reqwest::Client,
    ) -> Result<Self, DeliveryError> {
        let url = parse_http_url("url", &config.url)?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            let key = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| DeliveryError::InvalidConfig(format!("header `{key}`: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| DeliveryError::InvalidConfig(format!("header `{key}`: {e}")))?;
            headers.insert(key, value);
        }

        Ok(Self {
            name,
            url,
            headers,
            client,
        })
    }
}

/// JSON body sent to the webhook.
pub fn payload(event: &NotificationEvent) -> serde_json::Value {
    serde_json::json!({
        "id": event.id,
        "event_type": event.kind.as_str(),
        "serial": event.serial,
        "severity": event.severity,
        "category": event.category,
        "ring_entered": event.ring_entered,
        "title": event.title,
        "body": event.body,
        "distance_m": event.distance_m,
        "elevation_deg": event.elevation_deg,
        "prediction": event.prediction,
        "tracking_url": event.tracking_url(),
        "timestamp": event.created_at,
        "record": event.record,
    })
}

#[async_trait]
impl NotificationBackend for WebhookBackend {
    fn name(&self) -> &str {
        &self.name
    }

    /// Execute a single POST request and check the response status.
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&payload(event))
            .send()
            .await?;
        check_status(&response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_header_name_is_rejected() {
        let config = WebhookConfig {
            url: "https://example.com/hook".into(),
            headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
        };
        let result = WebhookBackend::new("webhook".into(), config, reqwest::Client::new());
        assert!(matches!(result, Err(DeliveryError::InvalidConfig(_))));
    }

    #[test]
    fn headers_are_kept() {
        let config = WebhookConfig {
            url: "https://example.com/hook".into(),
            headers: BTreeMap::from([("X-Token".to_string(), "s3cret".to_string())]),
        };
        let backend =
            WebhookBackend::new("webhook".into(), config, reqwest::Client::new()).expect("valid");
        assert_eq!(backend.headers.get("x-token").map(|v| v.as_bytes()), Some(&b"s3cret"[..]));
    }

    #[test]
    fn payload_carries_kind_and_ring() {
        let mut event = crate::testing::event("S1", sondenotify_core::TransitionKind::Updated);
        event.kind = sondenotify_core::NotificationKind::RingEntered;
        event.ring_entered = Some("home".into());
        let body = payload(&event);
        assert_eq!(body["event_type"], "ring_entered");
        assert_eq!(body["ring_entered"], "home");
        assert!(body["prediction"].is_null());
    }

    #[test]
    fn request_error_display() {
        // Build a reqwest error from an invalid URL.
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        let err = DeliveryError::Request(req_err);
        assert!(err.to_string().contains("HTTP request failed"));
    }
}
