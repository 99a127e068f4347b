//! Decoding of ground-station payload summaries into [`SondeObservation`]s.
//!
//! The ground station emits one JSON object per decoded radio frame. Only
//! messages of type `PAYLOAD_SUMMARY` (or untyped messages) carry telemetry;
//! everything else is rejected with [`DecodeError::UnsupportedType`] so the
//! caller can ignore it quietly.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SondeId, Timestamp};

/// Message type emitted by the ground station for telemetry frames.
pub const PAYLOAD_SUMMARY_TYPE: &str = "PAYLOAD_SUMMARY";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Reasons an inbound datagram could not be turned into an observation.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The datagram is not valid JSON, or a field has the wrong JSON type.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A required field is present but unusable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The message is valid but is not a telemetry summary.
    #[error("unsupported message type `{0}`")]
    UnsupportedType(String),
}

// ---------------------------------------------------------------------------
// SondeObservation
// ---------------------------------------------------------------------------

/// A single normalized telemetry sighting of a sonde.
///
/// Produced by the source adapter and consumed immediately by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SondeObservation {
    pub serial: SondeId,
    pub timestamp: Timestamp,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above mean sea level.
    pub altitude: f64,
    pub frame: Option<u64>,
    /// Sonde model as reported by the decoder, e.g. `RS41`.
    pub model: Option<String>,
    pub frequency_mhz: Option<f64>,
    /// Vertical velocity in m/s, negative while descending.
    pub vertical_velocity: Option<f64>,
    pub horizontal_velocity: Option<f64>,
    pub heading: Option<f64>,
    pub temperature: Option<f64>,
    /// Balloon burst has been reported.
    pub burst: bool,
    /// Explicit landing indicator. Authoritative when set.
    pub landed: bool,
}

/// Wire shape of a payload summary. Every field is optional here so that
/// missing required fields can be reported by name.
#[derive(Debug, Deserialize)]
struct RawPayloadSummary {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "serial")]
    callsign: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
    #[serde(alias = "datetime")]
    time: Option<String>,
    frame: Option<u64>,
    model: Option<String>,
    freq: Option<serde_json::Value>,
    freq_float: Option<f64>,
    vel_v: Option<f64>,
    vel_h: Option<f64>,
    heading: Option<f64>,
    temp: Option<f64>,
    burst: Option<bool>,
    landed: Option<bool>,
}

impl SondeObservation {
    /// Decode a raw datagram received at `received_at`.
    ///
    /// Unknown fields are ignored. `received_at` anchors time-of-day-only
    /// timestamps to a calendar date.
    pub fn from_datagram(bytes: &[u8], received_at: Timestamp) -> Result<Self, DecodeError> {
        let raw: RawPayloadSummary = serde_json::from_slice(bytes)?;
        Self::from_raw(raw, received_at)
    }

    fn from_raw(raw: RawPayloadSummary, received_at: Timestamp) -> Result<Self, DecodeError> {
        if let Some(kind) = raw.kind {
            if kind != PAYLOAD_SUMMARY_TYPE {
                return Err(DecodeError::UnsupportedType(kind));
            }
        }

        let serial = raw.callsign.ok_or(DecodeError::MissingField("callsign"))?;
        if serial.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "callsign",
                reason: "must not be empty".into(),
            });
        }

        let latitude = raw.latitude.ok_or(DecodeError::MissingField("latitude"))?;
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DecodeError::InvalidField {
                field: "latitude",
                reason: format!("{latitude} is outside [-90, 90]"),
            });
        }

        let longitude = raw.longitude.ok_or(DecodeError::MissingField("longitude"))?;
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DecodeError::InvalidField {
                field: "longitude",
                reason: format!("{longitude} is outside [-180, 180]"),
            });
        }

        let altitude = raw.altitude.ok_or(DecodeError::MissingField("altitude"))?;
        if !altitude.is_finite() {
            return Err(DecodeError::InvalidField {
                field: "altitude",
                reason: "must be a finite number".into(),
            });
        }

        let time = raw.time.ok_or(DecodeError::MissingField("time"))?;
        let timestamp = parse_time(&time, received_at)?;

        let frequency_mhz = raw
            .freq_float
            .or_else(|| raw.freq.as_ref().and_then(parse_frequency));

        Ok(Self {
            serial,
            timestamp,
            latitude,
            longitude,
            altitude,
            frame: raw.frame,
            model: raw.model.filter(|m| !m.is_empty()),
            frequency_mhz,
            vertical_velocity: raw.vel_v,
            horizontal_velocity: raw.vel_h,
            heading: raw.heading,
            temperature: raw.temp,
            burst: raw.burst.unwrap_or(false),
            landed: raw.landed.unwrap_or(false),
        })
    }
}

/// Parse an RFC 3339 timestamp, or a bare `HH:MM:SS` time of day.
///
/// Time-of-day values are placed on the UTC date of `received_at` and then
/// moved one day forward or back if that lands them more than twelve hours
/// away, which handles frames received just after midnight.
fn parse_time(raw: &str, received_at: Timestamp) -> Result<Timestamp, DecodeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let time = NaiveTime::parse_from_str(raw, "%H:%M:%S%.f").map_err(|e| {
        DecodeError::InvalidField {
            field: "time",
            reason: format!("`{raw}`: {e}"),
        }
    })?;

    let candidate = received_at.date_naive().and_time(time).and_utc();
    let half_day = Duration::hours(12);

    let adjusted = if candidate - received_at > half_day {
        candidate - Duration::days(1)
    } else if received_at - candidate > half_day {
        candidate + Duration::days(1)
    } else {
        candidate
    };

    Ok(adjusted)
}

/// Parse a frequency given either as a number in MHz or as text like
/// `"403.000 MHz"`.
fn parse_frequency(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s
            .trim()
            .trim_end_matches("MHz")
            .trim()
            .parse::<f64>()
            .ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
