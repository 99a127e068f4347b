//! Sonde tracking and notification policy.
//!
//! Everything in this crate is synchronous and free of I/O:
//!
//! - [`observation`]: decoding ground-station payload summaries.
//! - [`tracker`]: per-sonde lifecycle state machine and expiry sweep.
//! - [`policy`]: notification filters, range rings and rendering.
//! - [`prediction`]: landing prediction queries and responses.
//! - [`geo`]: station-relative distance and elevation.

pub mod error;
pub mod geo;
pub mod notification;
pub mod observation;
pub mod policy;
pub mod prediction;
pub mod tracker;
pub mod types;

pub use error::CoreError;
pub use geo::StationPosition;
pub use notification::{NotificationEvent, NotificationKind, NotificationTemplates, Severity};
pub use observation::{DecodeError, SondeObservation};
pub use policy::{Decision, PolicyConfig, PolicyEngine, RangeRing, RingTrigger, SuppressReason};
pub use prediction::{LandingPrediction, PredictionConfig, PredictionError, PredictionQuery};
pub use tracker::{
    LandingInference, LifecycleState, SondeRecord, SondeTracker, TrackerConfig, Transition,
    TransitionKind,
};
