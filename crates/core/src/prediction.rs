//! Landing prediction requests and responses.
//!
//! The daemon asks a Tawhiri-compatible API where a sonde will come down
//! and raises `predicted_landing` notifications when that point falls inside
//! a range ring. This module holds the I/O-free half: deciding which records
//! are due a prediction, building the query, and reading the response.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::tracker::{LifecycleState, SondeRecord};
use crate::types::Timestamp;

/// Public SondeHub Tawhiri instance.
pub const DEFAULT_API_URL: &str = "https://api.v2.sondehub.org/tawhiri";

/// Burst altitude sent for descending sondes sits just above the current
/// altitude so the predictor skips the ascent.
const DESCENT_BURST_MARGIN_M: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("Malformed prediction response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Prediction response has no trajectory")]
    EmptyTrajectory,
}

/// `[prediction]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PredictionConfig {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub api_url: String,
    /// Meters per second.
    #[validate(range(min = 0.1, max = 50.0))]
    pub ascent_rate: f64,
    #[validate(range(min = 1.0, max = 60_000.0))]
    pub burst_altitude_m: f64,
    /// Meters per second at sea level.
    #[validate(range(min = 0.1, max = 100.0))]
    pub descent_rate: f64,
    /// Skip sondes that are not strictly descending.
    pub only_descending: bool,
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: DEFAULT_API_URL.to_string(),
            ascent_rate: 5.0,
            burst_altitude_m: 26_000.0,
            descent_rate: 5.0,
            only_descending: true,
            timeout_secs: 3,
        }
    }
}

impl PredictionConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// The query for `record`, if it is due a prediction at `now`.
    ///
    /// A record qualifies while it is active, has enough altitude history to
    /// judge descent, and was heard within `freshness` of `now`.
    pub fn query_for(
        &self,
        record: &SondeRecord,
        now: Timestamp,
        freshness: Duration,
    ) -> Option<PredictionQuery> {
        if record.state != LifecycleState::Active {
            return None;
        }
        if record.altitudes().count() < 3 || now - record.last_seen > freshness {
            return None;
        }

        let descending = record.is_descending();
        if self.only_descending && !descending {
            return None;
        }

        let obs = &record.last_observation;
        let altitude = obs.altitude.trunc();
        let burst_altitude = if descending {
            altitude + DESCENT_BURST_MARGIN_M
        } else {
            self.burst_altitude_m
        };

        Some(PredictionQuery {
            latitude: obs.latitude,
            longitude: obs.longitude,
            altitude,
            launch_time: now,
            ascent_rate: self.ascent_rate,
            burst_altitude,
            descent_rate: self.descent_rate,
            descending,
        })
    }
}

/// One request to the prediction API.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub launch_time: Timestamp,
    pub ascent_rate: f64,
    pub burst_altitude: f64,
    pub descent_rate: f64,
    pub descending: bool,
}

impl PredictionQuery {
    /// Query string parameters in the order Tawhiri documents them.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("launch_latitude", self.latitude.to_string()),
            ("launch_longitude", self.longitude.to_string()),
            ("launch_altitude", self.altitude.to_string()),
            (
                "launch_datetime",
                self.launch_time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
            ("ascent_rate", self.ascent_rate.to_string()),
            ("burst_altitude", self.burst_altitude.to_string()),
            ("descent_rate", self.descent_rate.to_string()),
        ]
    }
}

/// Where and when a sonde is expected to land.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandingPrediction {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub landing_time: Timestamp,
}

#[derive(Deserialize)]
struct Response {
    prediction: Vec<Stage>,
}

#[derive(Deserialize)]
struct Stage {
    stage: String,
    trajectory: Vec<Point>,
}

#[derive(Deserialize)]
struct Point {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    datetime: Timestamp,
}

impl LandingPrediction {
    /// Read the last point of the descent stage from a Tawhiri response.
    pub fn from_response(body: &[u8]) -> Result<Self, PredictionError> {
        let response: Response = serde_json::from_slice(body)?;
        let stage = response
            .prediction
            .iter()
            .find(|s| s.stage == "descent")
            .or_else(|| response.prediction.last())
            .ok_or(PredictionError::EmptyTrajectory)?;
        let point = stage.trajectory.last().ok_or(PredictionError::EmptyTrajectory)?;

        // Tawhiri reports longitudes in [0, 360).
        let longitude = if point.longitude > 180.0 {
            point.longitude - 360.0
        } else {
            point.longitude
        };

        Ok(Self {
            latitude: point.latitude,
            longitude,
            altitude: point.altitude,
            landing_time: point.datetime,
        })
    }
}
