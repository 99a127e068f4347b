//! Log sink: writes notifications to the application log.
//!
//! Useful as a dry-run backend and as a record alongside real backends.
//! Entries go to the `sondenotify::notification` target so they can be
//! filtered independently, e.g. `RUST_LOG=sondenotify::notification=info`.

use async_trait::async_trait;
use serde::Deserialize;
use sondenotify_core::NotificationEvent;

use super::{DeliveryError, NotificationBackend};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Include the rendered body, not just the title.
    #[serde(default)]
    pub include_body: bool,
}

#[derive(Debug)]
pub struct LogBackend {
    name: String,
    config: LogConfig,
}

impl LogBackend {
    pub fn new(name: String, config: LogConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl NotificationBackend for LogBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let obs = &event.record.last_observation;
        if self.config.include_body {
            tracing::info!(
                target: "sondenotify::notification",
                serial = %event.serial,
                kind = event.kind.as_str(),
                severity = ?event.severity,
                altitude = obs.altitude,
                body = %event.body,
                "{}",
                event.title
            );
        } else {
            tracing::info!(
                target: "sondenotify::notification",
                serial = %event.serial,
                kind = event.kind.as_str(),
                severity = ?event.severity,
                altitude = obs.altitude,
                "{}",
                event.title
            );
        }
        Ok(())
    }
}
