//! Rendered notifications and their templates.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::prediction::LandingPrediction;
use crate::tracker::{SondeRecord, TransitionKind};
use crate::types::{SondeId, Timestamp};

/// Public tracking site for a sonde serial.
pub const SONDEHUB_URL: &str = "https://sondehub.org";

/// Placeholders understood by [`render`].
pub const PLACEHOLDERS: [&str; 17] = [
    "serial",
    "model",
    "event",
    "kind",
    "latitude",
    "longitude",
    "altitude_m",
    "distance_km",
    "elevation_deg",
    "frequency",
    "ring",
    "url",
    "time",
    "count",
    "landing_latitude",
    "landing_longitude",
    "landing_time",
];

const DEFAULT_TITLE: &str = "{model} sonde {serial}: {event}";

const DEFAULT_BODY: &str = "Serial:     {serial}
Type:       {model}
Event:      {event}
Altitude:   {altitude_m} m
Distance:   {distance_km} km
Elevation:  {elevation_deg} deg
Frequency:  {frequency} MHz
Position:   {latitude} {longitude}
Range ring: {ring}

Track on SondeHub:
{url}";

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FirstSeen,
    Updated,
    Landed,
    Expired,
    Reappeared,
    /// The sonde entered a range ring for the first time.
    RingEntered,
    /// The predicted landing point falls inside a range ring.
    PredictedLanding,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FirstSeen => "first_seen",
            NotificationKind::Updated => "updated",
            NotificationKind::Landed => "landed",
            NotificationKind::Expired => "expired",
            NotificationKind::Reappeared => "reappeared",
            NotificationKind::RingEntered => "ring_entered",
            NotificationKind::PredictedLanding => "predicted_landing",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            NotificationKind::FirstSeen => "new sonde detected",
            NotificationKind::Updated => "sonde updated",
            NotificationKind::Landed => "sonde landed",
            NotificationKind::Expired => "sonde lost",
            NotificationKind::Reappeared => "sonde reappeared",
            NotificationKind::RingEntered => "sonde entered range ring",
            NotificationKind::PredictedLanding => "landing predicted in range ring",
        }
    }
}

impl From<TransitionKind> for NotificationKind {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::FirstSeen => NotificationKind::FirstSeen,
            TransitionKind::Updated => NotificationKind::Updated,
            TransitionKind::Landed => NotificationKind::Landed,
            TransitionKind::Expired => NotificationKind::Expired,
            TransitionKind::Reappeared => NotificationKind::Reappeared,
        }
    }
}

impl PartialEq<TransitionKind> for NotificationKind {
    fn eq(&self, other: &TransitionKind) -> bool {
        *self == NotificationKind::from(*other)
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly a backend should present the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Normal,
    High,
}

impl Severity {
    pub fn for_kind(kind: impl Into<NotificationKind>) -> Self {
        match kind.into() {
            NotificationKind::Landed
            | NotificationKind::RingEntered
            | NotificationKind::PredictedLanding => Severity::High,
            NotificationKind::FirstSeen | NotificationKind::Reappeared => Severity::Normal,
            NotificationKind::Updated | NotificationKind::Expired => Severity::Low,
        }
    }
}

/// Title and body templates with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationTemplates {
    pub title: String,
    pub body: String,
}

impl Default for NotificationTemplates {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            body: DEFAULT_BODY.to_string(),
        }
    }
}

impl NotificationTemplates {
    /// Reject templates that reference unknown placeholders.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, template) in [("title", &self.title), ("body", &self.body)] {
            for placeholder in placeholders_in(template) {
                if !PLACEHOLDERS.contains(&placeholder) {
                    return Err(CoreError::Validation(format!(
                        "{name} template uses unknown placeholder {{{placeholder}}}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub serial: SondeId,
    pub kind: NotificationKind,
    pub severity: Severity,
    /// Name of the smallest range ring the sonde is inside, when rings are
    /// configured. Prediction notifications use `prediction_<ring>`.
    pub category: Option<String>,
    /// Ring this notification fires for the first time. That ring and every
    /// larger one are not fired again for the same record.
    pub ring_entered: Option<String>,
    pub title: String,
    pub body: String,
    pub distance_m: Option<f64>,
    pub elevation_deg: Option<f64>,
    pub prediction: Option<LandingPrediction>,
    pub record: SondeRecord,
    pub created_at: Timestamp,
}

impl NotificationEvent {
    pub fn new(
        kind: impl Into<NotificationKind>,
        record: SondeRecord,
        title: String,
        body: String,
    ) -> Self {
        let kind = kind.into();
        Self {
            id: Uuid::now_v7(),
            serial: record.serial.clone(),
            kind,
            severity: Severity::for_kind(kind),
            category: None,
            ring_entered: None,
            title,
            body,
            distance_m: None,
            elevation_deg: None,
            prediction: None,
            record,
            created_at: Utc::now(),
        }
    }

    pub fn tracking_url(&self) -> String {
        tracking_url(&self.serial)
    }
}

pub fn tracking_url(serial: &str) -> String {
    format!("{SONDEHUB_URL}/{serial}")
}

/// Substitute `{name}` placeholders from `vars`. Unknown placeholders are
/// left untouched.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholders_in(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            break;
        };
        names.push(&after[..end]);
        rest = &after[end + 1..];
    }
    names
}
