#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sondenotify_core::types::Timestamp;
use sondenotify_core::{NotificationEvent, SondeObservation, StationPosition};
use sondenotify_daemon::DaemonConfig;
use sondenotify_events::{DeliveryError, DispatchReport, NotificationBackend};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// What a [`MockBackend`] has seen, shared with the test.
#[derive(Clone, Default)]
pub struct MockLog {
    calls: Arc<AtomicU32>,
    delivered: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl MockLog {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<NotificationEvent> {
        self.delivered.lock().unwrap().clone()
    }
}

pub struct MockBackend {
    name: String,
    fail: bool,
    latency: Duration,
    log: MockLog,
}

impl MockBackend {
    pub fn succeeding(name: &str) -> (Self, MockLog) {
        Self::build(name, false)
    }

    pub fn failing(name: &str) -> (Self, MockLog) {
        Self::build(name, true)
    }

    fn build(name: &str, fail: bool) -> (Self, MockLog) {
        let log = MockLog::default();
        let backend = Self {
            name: name.to_string(),
            fail,
            latency: Duration::ZERO,
            log: log.clone(),
        };
        (backend, log)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl NotificationBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(DeliveryError::HttpStatus(503));
        }
        self.log.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const SERIAL: &str = "S1234567";

/// Station 11 km south of the sonde fixtures.
pub fn station() -> StationPosition {
    StationPosition {
        latitude: 48.0,
        longitude: 11.5,
        altitude_m: 0.0,
    }
}

/// Loopback listener on an ephemeral port; automatic sweeps effectively off.
pub fn config() -> DaemonConfig {
    let mut config = DaemonConfig::from_toml_str(
        r#"
        [listener]
        host = "127.0.0.1"
        port = 0

        [tracker]
        sweep_interval_secs = 86400

        [[backends]]
        kind = "log"
        "#,
    )
    .expect("valid test config");
    config.station = Some(station());
    config
}

pub fn observation(serial: &str, at: Timestamp, altitude: f64) -> SondeObservation {
    SondeObservation {
        serial: serial.to_string(),
        timestamp: at,
        latitude: 48.1,
        longitude: 11.5,
        altitude,
        frame: None,
        model: Some("RS41".into()),
        frequency_mhz: Some(403.0),
        vertical_velocity: None,
        horizontal_velocity: None,
        heading: None,
        temperature: None,
        burst: false,
        landed: false,
    }
}

/// An AutoRX payload summary datagram stamped with the current time.
pub fn payload_summary(serial: &str, altitude: f64) -> Vec<u8> {
    serde_json::json!({
        "type": "PAYLOAD_SUMMARY",
        "station": "N0CALL",
        "callsign": serial,
        "latitude": 48.1,
        "longitude": 11.5,
        "altitude": altitude,
        "time": Utc::now().to_rfc3339(),
        "model": "RS41",
        "freq": "403.000 MHz",
        "frame": 100
    })
    .to_string()
    .into_bytes()
}

pub async fn next_report(rx: &mut mpsc::UnboundedReceiver<DispatchReport>) -> DispatchReport {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("report within timeout")
        .expect("report channel open")
}
