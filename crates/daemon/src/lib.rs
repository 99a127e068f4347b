//! The sondenotify daemon: UDP intake, the tracker task, the expiry sweeper,
//! the health endpoint and their shutdown sequence.
//!
//! The binary in `main.rs` is a thin wrapper around [`Daemon`].

pub mod config;
pub mod daemon;
pub mod engine;
pub mod health;
pub mod listener;
pub mod prediction;
pub mod sweeper;

pub use config::{ConfigError, DaemonConfig};
pub use daemon::{Daemon, DaemonError, ShutdownSummary};
pub use engine::{Predictions, TrackerCommand, TrackerHandle, TrackerStatus};
pub use health::{HealthChecker, HealthReport, HealthState};
pub use prediction::{LandingPredictor, PredictError, TawhiriClient};
