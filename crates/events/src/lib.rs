//! Notification delivery for sondenotify.
//!
//! - [`delivery`]: the [`NotificationBackend`] capability and the built-in
//!   backends (ntfy, Gotify, Discord, generic webhook, email, log).
//! - [`dispatcher`]: concurrent fan-out with bounded retry, per-call
//!   timeouts, cancellation and a cap on in-flight events.
//! - [`retry`]: the backoff policy.

pub mod delivery;
pub mod dispatcher;
pub mod retry;

pub use delivery::{build_backends, Backend, BackendConfig, DeliveryError, NotificationBackend};
pub use dispatcher::{
    BackendReport, DeliveryOutcome, DispatchReport, Dispatcher, DEFAULT_MAX_IN_FLIGHT,
};
pub use retry::RetryPolicy;

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{TimeZone, Utc};
    use sondenotify_core::{
        NotificationEvent, SondeObservation, SondeTracker, TrackerConfig, TransitionKind,
    };

    pub fn event(serial: &str, kind: TransitionKind) -> NotificationEvent {
        let mut tracker = SondeTracker::new(TrackerConfig::default());
        let transition = tracker
            .observe(SondeObservation {
                serial: serial.to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                latitude: 48.1,
                longitude: 11.5,
                altitude: 850.0,
                frame: Some(4200),
                model: Some("RS41".into()),
                frequency_mhz: Some(403.0),
                vertical_velocity: Some(-4.8),
                horizontal_velocity: None,
                heading: None,
                temperature: None,
                burst: true,
                landed: false,
            })
            .expect("first observation");
        NotificationEvent::new(
            kind,
            transition.record,
            format!("RS41 sonde {serial}: {kind}"),
            format!("{} at 850 m", kind.describe()),
        )
    }
}
