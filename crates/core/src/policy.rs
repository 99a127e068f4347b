//! Notification policy: filters and rendering.
//!
//! Pure logic, no I/O. [`PolicyEngine::evaluate`] runs an ordered chain of
//! independently configurable filters combined by logical AND; the first
//! failing filter suppresses the transition and names the reason.
//!
//! Range rings also notify on their own: the first time a sonde is inside a
//! ring that has not fired for it yet, the transition notifies as
//! `ring_entered` even when its lifecycle kind would not. Once a ring fires,
//! it and every larger ring stay quiet for that record. Predicted landing
//! points are checked against a separate set of fired rings.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::geo::StationPosition;
use crate::notification::{
    render, tracking_url, NotificationEvent, NotificationKind, NotificationTemplates,
};
use crate::prediction::LandingPrediction;
use crate::tracker::{SondeRecord, SondeTracker, Transition, TransitionKind};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A circular zone around the station with an altitude ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RangeRing {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = 0.0))]
    pub radius_km: f64,
    #[validate(range(min = 0.0))]
    pub max_altitude_m: f64,
}

impl RangeRing {
    fn contains(&self, distance_m: f64, altitude_m: f64) -> bool {
        distance_m <= self.radius_km * 1000.0 && altitude_m <= self.max_altitude_m
    }
}

/// What placed a sonde inside a ring: its reported position or its
/// predicted landing point. Each keeps its own set of fired rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingTrigger {
    Position,
    Prediction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PolicyConfig {
    /// Transition kinds that may notify. Empty means nothing notifies.
    pub notify_on: Vec<TransitionKind>,
    /// `Updated` transitions only notify when the burst or landing flag
    /// changed.
    pub updates_require_flag_change: bool,
    #[validate(range(min = -90.0, max = 90.0))]
    pub min_elevation_deg: Option<f64>,
    #[validate(range(min = 0.0))]
    pub max_distance_km: Option<f64>,
    /// When set, only these sonde models notify (case-insensitive).
    pub allowed_types: Option<Vec<String>>,
    /// These sonde models never notify (case-insensitive).
    pub denied_types: Vec<String>,
    #[validate(nested)]
    pub range_rings: Vec<RangeRing>,
    pub templates: NotificationTemplates,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            notify_on: vec![
                TransitionKind::FirstSeen,
                TransitionKind::Landed,
                TransitionKind::Reappeared,
            ],
            updates_require_flag_change: true,
            min_elevation_deg: None,
            max_distance_km: None,
            allowed_types: None,
            denied_types: Vec::new(),
            range_rings: Vec::new(),
            templates: NotificationTemplates::default(),
        }
    }
}

impl PolicyConfig {
    /// A configuration with every filter disabled and every kind allowed.
    pub fn permissive() -> Self {
        Self {
            notify_on: TransitionKind::ALL.to_vec(),
            updates_require_flag_change: false,
            ..Self::default()
        }
    }

    /// Field ranges plus the cross-field rules that need the station.
    pub fn check(&self, station: Option<&StationPosition>) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(format!("policy: {e}")))?;

        if station.is_none() {
            if self.min_elevation_deg.is_some() {
                return Err(CoreError::Validation(
                    "policy.min_elevation_deg requires a [station] position".into(),
                ));
            }
            if self.max_distance_km.is_some() {
                return Err(CoreError::Validation(
                    "policy.max_distance_km requires a [station] position".into(),
                ));
            }
            if !self.range_rings.is_empty() {
                return Err(CoreError::Validation(
                    "policy.range_rings require a [station] position".into(),
                ));
            }
        }

        if let Some(allowed) = &self.allowed_types {
            let denied = normalize(&self.denied_types);
            if let Some(both) = normalize(allowed).intersection(&denied).next() {
                return Err(CoreError::Validation(format!(
                    "sonde type {both} is both allowed and denied"
                )));
            }
        }

        let mut names = HashSet::new();
        for ring in &self.range_rings {
            if !names.insert(ring.name.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate range ring name {}",
                    ring.name
                )));
            }
        }

        self.templates.validate()
    }
}

fn normalize(types: &[String]) -> HashSet<String> {
    types.iter().map(|t| t.trim().to_ascii_uppercase()).collect()
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why a transition did not produce a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SuppressReason {
    KindNotAllowed(TransitionKind),
    UpdateWithoutFlagChange,
    TypeNotAllowed(Option<String>),
    TypeDenied(String),
    TooFar { distance_m: f64, max_m: f64 },
    TooLow { elevation_deg: f64, min_deg: f64 },
    OutsideRangeRings { distance_m: f64, altitude_m: f64 },
    RingAlreadyNotified(String),
    NoRangeRings,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::KindNotAllowed(kind) => write!(f, "transition {kind} not allowed"),
            SuppressReason::UpdateWithoutFlagChange => {
                f.write_str("update without burst/landing flag change")
            }
            SuppressReason::TypeNotAllowed(Some(model)) => {
                write!(f, "sonde type {model} not in allow list")
            }
            SuppressReason::TypeNotAllowed(None) => {
                f.write_str("sonde type unknown and an allow list is set")
            }
            SuppressReason::TypeDenied(model) => write!(f, "sonde type {model} denied"),
            SuppressReason::TooFar { distance_m, max_m } => {
                write!(f, "distance {distance_m:.0} m exceeds {max_m:.0} m")
            }
            SuppressReason::TooLow {
                elevation_deg,
                min_deg,
            } => write!(f, "elevation {elevation_deg:.1} deg below {min_deg:.1} deg"),
            SuppressReason::OutsideRangeRings {
                distance_m,
                altitude_m,
            } => write!(
                f,
                "outside every range ring ({distance_m:.0} m, {altitude_m:.0} m altitude)"
            ),
            SuppressReason::RingAlreadyNotified(ring) => {
                write!(f, "range ring {ring} already notified")
            }
            SuppressReason::NoRangeRings => f.write_str("no range rings or station configured"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Notify(Box<NotificationEvent>),
    Suppress(SuppressReason),
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

pub struct PolicyEngine {
    config: PolicyConfig,
    station: Option<StationPosition>,
    allowed_kinds: HashSet<TransitionKind>,
    allowed_types: Option<HashSet<String>>,
    denied_types: HashSet<String>,
    /// Sorted by ascending radius so the first hit is the smallest ring.
    rings: Vec<RangeRing>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig, station: Option<StationPosition>) -> Result<Self, CoreError> {
        config.check(station.as_ref())?;

        let mut rings = config.range_rings.clone();
        rings.sort_by(|a, b| a.radius_km.total_cmp(&b.radius_km));

        Ok(Self {
            allowed_kinds: config.notify_on.iter().copied().collect(),
            allowed_types: config.allowed_types.as_deref().map(normalize),
            denied_types: normalize(&config.denied_types),
            rings,
            station,
            config,
        })
    }

    /// Convenience wrapper around [`evaluate`](Self::evaluate).
    pub fn decide(&self, transition: &Transition) -> Option<NotificationEvent> {
        match self.evaluate(transition) {
            Decision::Notify(event) => Some(*event),
            Decision::Suppress(_) => None,
        }
    }

    /// Run every filter in order and render the notification on success.
    pub fn evaluate(&self, transition: &Transition) -> Decision {
        let record = &transition.record;
        let obs = &record.last_observation;

        let distance_m = self
            .station
            .map(|s| s.distance_to(obs.latitude, obs.longitude));
        let elevation_deg = self
            .station
            .map(|s| s.elevation_to(obs.latitude, obs.longitude, obs.altitude));

        // Sweep-generated expiries carry a stale position and never enter a ring.
        let entered = match (transition.kind, distance_m) {
            (TransitionKind::Expired, _) | (_, None) => None,
            (_, Some(distance_m)) => {
                self.unfired_ring(distance_m, obs.altitude, record.notified(RingTrigger::Position))
            }
        };

        let mut kind = NotificationKind::from(transition.kind);
        if let Some(reason) = self.lifecycle_filter(transition) {
            if entered.is_none() {
                return Decision::Suppress(reason);
            }
            kind = NotificationKind::RingEntered;
        }

        if let Some(reason) = self.type_filter(obs.model.as_deref()) {
            return Decision::Suppress(reason);
        }

        if let (Some(max_km), Some(distance_m)) = (self.config.max_distance_km, distance_m) {
            let max_m = max_km * 1000.0;
            if distance_m > max_m {
                return Decision::Suppress(SuppressReason::TooFar { distance_m, max_m });
            }
        }

        if let (Some(min_deg), Some(elevation_deg)) = (self.config.min_elevation_deg, elevation_deg) {
            if elevation_deg < min_deg {
                return Decision::Suppress(SuppressReason::TooLow {
                    elevation_deg,
                    min_deg,
                });
            }
        }

        let mut ring = None;
        if let (false, Some(distance_m)) = (self.rings.is_empty(), distance_m) {
            match self.rings.iter().find(|r| r.contains(distance_m, obs.altitude)) {
                Some(r) => ring = Some(r.name.clone()),
                None => {
                    return Decision::Suppress(SuppressReason::OutsideRangeRings {
                        distance_m,
                        altitude_m: obs.altitude,
                    })
                }
            }
        }

        let vars = self.template_vars(TemplateInput {
            kind,
            record,
            at: transition.at,
            distance_m,
            elevation_deg,
            ring: ring.as_deref(),
            prediction: None,
        });
        let title = render(&self.config.templates.title, &vars);
        let body = render(&self.config.templates.body, &vars);

        let mut event = NotificationEvent::new(kind, record.clone(), title, body);
        event.category = ring;
        event.ring_entered = entered.map(|r| r.name.clone());
        event.distance_m = distance_m;
        event.elevation_deg = elevation_deg;
        Decision::Notify(Box::new(event))
    }

    /// Check a predicted landing point against the range rings.
    ///
    /// Notifies once per ring the prediction enters, independently of the
    /// rings the sonde itself has entered. The sonde type filters apply; the
    /// lifecycle, distance and elevation filters describe the sonde's
    /// current position and do not.
    pub fn evaluate_prediction(
        &self,
        record: &SondeRecord,
        prediction: &LandingPrediction,
        at: crate::types::Timestamp,
    ) -> Decision {
        let Some(station) = self.station.filter(|_| !self.rings.is_empty()) else {
            return Decision::Suppress(SuppressReason::NoRangeRings);
        };

        if let Some(reason) = self.type_filter(record.last_observation.model.as_deref()) {
            return Decision::Suppress(reason);
        }

        let distance_m = station.distance_to(prediction.latitude, prediction.longitude);
        let altitude_m = prediction.altitude;
        let Some(ring) = self.unfired_ring(
            distance_m,
            altitude_m,
            record.notified(RingTrigger::Prediction),
        ) else {
            return Decision::Suppress(
                match self.rings.iter().find(|r| r.contains(distance_m, altitude_m)) {
                    Some(r) => SuppressReason::RingAlreadyNotified(r.name.clone()),
                    None => SuppressReason::OutsideRangeRings {
                        distance_m,
                        altitude_m,
                    },
                },
            );
        };

        let kind = NotificationKind::PredictedLanding;
        let vars = self.template_vars(TemplateInput {
            kind,
            record,
            at,
            distance_m: Some(distance_m),
            elevation_deg: None,
            ring: Some(&ring.name),
            prediction: Some(prediction),
        });
        let title = render(&self.config.templates.title, &vars);
        let body = render(&self.config.templates.body, &vars);

        let mut event = NotificationEvent::new(kind, record.clone(), title, body);
        event.category = Some(format!("prediction_{}", ring.name));
        event.ring_entered = Some(ring.name.clone());
        event.distance_m = Some(distance_m);
        event.prediction = Some(prediction.clone());
        Decision::Notify(Box::new(event))
    }

    /// Block the ring `event` fired, and every larger ring, for its record.
    pub fn record_fired(&self, tracker: &mut SondeTracker, event: &NotificationEvent) {
        let Some(entered) = event.ring_entered.as_deref() else {
            return;
        };
        let trigger = match event.kind {
            NotificationKind::PredictedLanding => RingTrigger::Prediction,
            _ => RingTrigger::Position,
        };
        tracker.mark_rings_notified(&event.serial, trigger, self.rings_from(entered));
    }

    /// `ring` and every ring at least as large, by name.
    pub fn rings_from(&self, ring: &str) -> Vec<String> {
        let Some(radius) = self.rings.iter().find(|r| r.name == ring).map(|r| r.radius_km) else {
            return Vec::new();
        };
        self.rings
            .iter()
            .filter(|r| r.radius_km >= radius)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Smallest ring containing the point that has not fired yet.
    fn unfired_ring(
        &self,
        distance_m: f64,
        altitude_m: f64,
        fired: &std::collections::BTreeSet<String>,
    ) -> Option<&RangeRing> {
        self.rings
            .iter()
            .filter(|r| !fired.contains(&r.name))
            .find(|r| r.contains(distance_m, altitude_m))
    }

    fn lifecycle_filter(&self, transition: &Transition) -> Option<SuppressReason> {
        if !self.allowed_kinds.contains(&transition.kind) {
            return Some(SuppressReason::KindNotAllowed(transition.kind));
        }
        if transition.kind == TransitionKind::Updated
            && self.config.updates_require_flag_change
            && !transition.flags_changed
        {
            return Some(SuppressReason::UpdateWithoutFlagChange);
        }
        None
    }

    fn type_filter(&self, model: Option<&str>) -> Option<SuppressReason> {
        let model = model.map(|m| m.trim().to_ascii_uppercase());
        if let Some(allowed) = &self.allowed_types {
            match &model {
                Some(m) if allowed.contains(m) => {}
                _ => return Some(SuppressReason::TypeNotAllowed(model)),
            }
        }
        match model {
            Some(m) if self.denied_types.contains(&m) => Some(SuppressReason::TypeDenied(m)),
            _ => None,
        }
    }

    fn template_vars(&self, input: TemplateInput<'_>) -> HashMap<&'static str, String> {
        let record = input.record;
        let obs = &record.last_observation;
        let unknown = || "unknown".to_string();

        let event = match (input.kind, input.ring) {
            (NotificationKind::RingEntered, Some(ring)) => format!("sonde entered range ring {ring}"),
            (NotificationKind::PredictedLanding, Some(ring)) => {
                format!("landing predicted in range ring {ring}")
            }
            (kind, _) => kind.describe().to_string(),
        };
        let prediction = input.prediction;

        HashMap::from([
            ("serial", record.serial.clone()),
            ("model", obs.model.clone().unwrap_or_else(unknown)),
            ("event", event),
            ("kind", input.kind.as_str().to_string()),
            ("latitude", format!("{:.5}", obs.latitude)),
            ("longitude", format!("{:.5}", obs.longitude)),
            ("altitude_m", format!("{:.0}", obs.altitude)),
            (
                "distance_km",
                input
                    .distance_m
                    .map_or_else(unknown, |d| format!("{:.1}", d / 1000.0)),
            ),
            (
                "elevation_deg",
                input.elevation_deg.map_or_else(unknown, |e| format!("{e:.1}")),
            ),
            (
                "frequency",
                obs.frequency_mhz.map_or_else(unknown, |f| format!("{f:.3}")),
            ),
            (
                "ring",
                input.ring.map_or_else(|| "none".to_string(), str::to_string),
            ),
            ("url", tracking_url(&record.serial)),
            ("time", input.at.to_rfc3339()),
            ("count", record.observation_count.to_string()),
            (
                "landing_latitude",
                prediction.map_or_else(unknown, |p| format!("{:.5}", p.latitude)),
            ),
            (
                "landing_longitude",
                prediction.map_or_else(unknown, |p| format!("{:.5}", p.longitude)),
            ),
            (
                "landing_time",
                prediction.map_or_else(unknown, |p| p.landing_time.to_rfc3339()),
            ),
        ])
    }
}

struct TemplateInput<'a> {
    kind: NotificationKind,
    record: &'a SondeRecord,
    at: crate::types::Timestamp,
    distance_m: Option<f64>,
    elevation_deg: Option<f64>,
    ring: Option<&'a str>,
    prediction: Option<&'a LandingPrediction>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::SondeObservation;
    use crate::tracker::TrackerConfig;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    fn station() -> StationPosition {
        StationPosition {
            latitude: 48.0,
            longitude: 11.0,
            altitude_m: 500.0,
        }
    }

    /// Build a real transition by running an observation through a tracker.
    fn transition(model: Option<&str>, lat: f64, altitude: f64) -> Transition {
        let mut tracker = SondeTracker::new(TrackerConfig::default());
        tracker
            .observe(SondeObservation {
                serial: "S1234567".into(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                latitude: lat,
                longitude: 11.0,
                altitude,
                frame: None,
                model: model.map(str::to_string),
                frequency_mhz: Some(403.0),
                vertical_velocity: None,
                horizontal_velocity: None,
                heading: None,
                temperature: None,
                burst: false,
                landed: false,
            })
            .expect("first observation always transitions")
    }

    fn engine(config: PolicyConfig) -> PolicyEngine {
        PolicyEngine::new(config, Some(station())).expect("valid policy")
    }

    #[test]
    fn permissive_policy_notifies_allowed_kind() {
        let decision = engine(PolicyConfig::permissive()).evaluate(&transition(Some("RS41"), 48.01, 500.0));
        let event = assert_matches!(decision, Decision::Notify(e) => e);
        assert_eq!(event.serial, "S1234567");
        assert_eq!(event.kind, TransitionKind::FirstSeen);
        assert!(event.title.contains("RS41 sonde S1234567"));
        assert!(event.body.contains("https://sondehub.org/S1234567"));
        assert!(event.distance_m.unwrap() > 1000.0);
    }

    #[test]
    fn empty_kind_set_notifies_nothing() {
        let config = PolicyConfig {
            notify_on: vec![],
            ..PolicyConfig::permissive()
        };
        let decision = engine(config).evaluate(&transition(Some("RS41"), 48.01, 500.0));
        assert_matches!(decision, Decision::Suppress(SuppressReason::KindNotAllowed(_)));
    }

    #[test]
    fn updates_need_flag_change_by_default() {
        let mut t = transition(Some("RS41"), 48.01, 500.0);
        t.kind = TransitionKind::Updated;
        let config = PolicyConfig {
            notify_on: vec![TransitionKind::Updated],
            ..PolicyConfig::default()
        };
        let policy = engine(config);
        assert_matches!(
            policy.evaluate(&t),
            Decision::Suppress(SuppressReason::UpdateWithoutFlagChange)
        );
        t.flags_changed = true;
        assert_matches!(policy.evaluate(&t), Decision::Notify(_));
    }

    #[test]
    fn type_allow_and_deny_sets_are_case_insensitive() {
        let config = PolicyConfig {
            allowed_types: Some(vec!["rs41".into()]),
            ..PolicyConfig::permissive()
        };
        let policy = engine(config);
        assert_matches!(policy.evaluate(&transition(Some("RS41"), 48.01, 500.0)), Decision::Notify(_));
        assert_matches!(
            policy.evaluate(&transition(Some("DFM17"), 48.01, 500.0)),
            Decision::Suppress(SuppressReason::TypeNotAllowed(Some(_)))
        );
        assert_matches!(
            policy.evaluate(&transition(None, 48.01, 500.0)),
            Decision::Suppress(SuppressReason::TypeNotAllowed(None))
        );

        let config = PolicyConfig {
            denied_types: vec!["Dfm17".into()],
            ..PolicyConfig::permissive()
        };
        assert_matches!(
            engine(config).evaluate(&transition(Some("DFM17"), 48.01, 500.0)),
            Decision::Suppress(SuppressReason::TypeDenied(_))
        );
    }

    #[test]
    fn distance_filter_suppresses_far_sondes() {
        let config = PolicyConfig {
            max_distance_km: Some(50.0),
            ..PolicyConfig::permissive()
        };
        let policy = engine(config);
        // About 11 km north.
        assert_matches!(policy.evaluate(&transition(None, 48.1, 5000.0)), Decision::Notify(_));
        // About 111 km north.
        assert_matches!(
            policy.evaluate(&transition(None, 49.0, 5000.0)),
            Decision::Suppress(SuppressReason::TooFar { .. })
        );
    }

    #[test]
    fn elevation_filter_suppresses_low_sondes() {
        let config = PolicyConfig {
            min_elevation_deg: Some(5.0),
            ..PolicyConfig::permissive()
        };
        let policy = engine(config);
        // 11 km away at 20 km altitude: well above the horizon.
        assert_matches!(policy.evaluate(&transition(None, 48.1, 20_000.0)), Decision::Notify(_));
        // 111 km away near the ground: below the horizon.
        assert_matches!(
            policy.evaluate(&transition(None, 49.0, 600.0)),
            Decision::Suppress(SuppressReason::TooLow { .. })
        );
    }

    #[test]
    fn smallest_matching_range_ring_is_attached() {
        let config = PolicyConfig {
            range_rings: vec![
                RangeRing {
                    name: "outer".into(),
                    radius_km: 100.0,
                    max_altitude_m: 30_000.0,
                },
                RangeRing {
                    name: "inner".into(),
                    radius_km: 20.0,
                    max_altitude_m: 2_000.0,
                },
            ],
            ..PolicyConfig::permissive()
        };
        let policy = engine(config);

        let event = assert_matches!(policy.evaluate(&transition(None, 48.1, 1_000.0)), Decision::Notify(e) => e);
        assert_eq!(event.category.as_deref(), Some("inner"));
        assert!(event.body.contains("Range ring: inner"));

        let event = assert_matches!(policy.evaluate(&transition(None, 48.1, 10_000.0)), Decision::Notify(e) => e);
        assert_eq!(event.category.as_deref(), Some("outer"));

        assert_matches!(
            policy.evaluate(&transition(None, 50.0, 1_000.0)),
            Decision::Suppress(SuppressReason::OutsideRangeRings { .. })
        );
    }

    #[test]
    fn notified_iff_every_filter_passes() {
        let config = PolicyConfig {
            max_distance_km: Some(50.0),
            min_elevation_deg: Some(5.0),
            allowed_types: Some(vec!["RS41".into()]),
            ..PolicyConfig::permissive()
        };
        let policy = engine(config);
        assert!(policy.decide(&transition(Some("RS41"), 48.1, 20_000.0)).is_some());
        assert!(policy.decide(&transition(Some("M10"), 48.1, 20_000.0)).is_none());
        assert!(policy.decide(&transition(Some("RS41"), 49.0, 20_000.0)).is_none());
        assert!(policy.decide(&transition(Some("RS41"), 48.3, 600.0)).is_none());
    }

    #[test]
    fn decision_is_deterministic_apart_from_identity() {
        let policy = engine(PolicyConfig::permissive());
        let t = transition(Some("RS41"), 48.01, 500.0);
        let a = policy.decide(&t).unwrap();
        let b = policy.decide(&t).unwrap();
        assert_eq!(a.title, b.title);
        assert_eq!(a.body, b.body);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn geo_filters_without_station_are_rejected() {
        let config = PolicyConfig {
            max_distance_km: Some(10.0),
            ..PolicyConfig::default()
        };
        let err = PolicyEngine::new(config, None).err().expect("should fail");
        assert!(err.to_string().contains("station"));
    }

    #[test]
    fn overlapping_allow_and_deny_is_rejected() {
        let config = PolicyConfig {
            allowed_types: Some(vec!["RS41".into()]),
            denied_types: vec!["rs41".into()],
            ..PolicyConfig::default()
        };
        assert!(PolicyEngine::new(config, Some(station())).is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let config = PolicyConfig {
            min_elevation_deg: Some(120.0),
            ..PolicyConfig::default()
        };
        assert!(PolicyEngine::new(config, Some(station())).is_err());
    }

    fn rings() -> Vec<RangeRing> {
        vec![
            RangeRing {
                name: "outer".into(),
                radius_km: 100.0,
                max_altitude_m: 30_000.0,
            },
            RangeRing {
                name: "inner".into(),
                radius_km: 20.0,
                max_altitude_m: 5_000.0,
            },
        ]
    }

    fn approach(tracker: &mut SondeTracker, secs: i64, lat: f64, altitude: f64) -> Transition {
        tracker
            .observe(SondeObservation {
                serial: "S1234567".into(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                    + chrono::Duration::seconds(secs),
                latitude: lat,
                longitude: 11.0,
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
            })
            .expect("in-order observation")
    }

    /// Evaluate and, like the daemon, remember the rings that fired.
    fn step(policy: &PolicyEngine, tracker: &mut SondeTracker, t: &Transition) -> Option<NotificationEvent> {
        let event = policy.decide(t)?;
        policy.record_fired(tracker, &event);
        Some(event)
    }

    #[test]
    fn descending_into_a_ring_notifies_once_under_default_policy() {
        let policy = engine(PolicyConfig {
            range_rings: vec![RangeRing {
                name: "home".into(),
                radius_km: 20.0,
                max_altitude_m: 5_000.0,
            }],
            ..PolicyConfig::default()
        });
        let mut tracker = SondeTracker::new(TrackerConfig::default());

        let mut events = Vec::new();
        for (secs, lat, altitude) in [
            (0, 49.0, 20_000.0),
            (60, 48.5, 8_000.0),
            (120, 48.1, 3_000.0),
            (180, 48.05, 1_000.0),
        ] {
            let t = approach(&mut tracker, secs, lat, altitude);
            events.extend(step(&policy, &mut tracker, &t));
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::RingEntered);
        assert_eq!(events[0].ring_entered.as_deref(), Some("home"));
        assert!(events[0].title.contains("entered range ring home"));
        assert!(tracker.get("S1234567").unwrap().notified_rings.contains("home"));
    }

    #[test]
    fn entering_a_ring_blocks_it_and_every_larger_ring() {
        let policy = engine(PolicyConfig {
            range_rings: rings(),
            ..PolicyConfig::default()
        });
        let mut tracker = SondeTracker::new(TrackerConfig::default());

        // First seen inside the outer ring: a lifecycle notification that
        // also fires the outer ring.
        let t = approach(&mut tracker, 0, 48.5, 10_000.0);
        let first = step(&policy, &mut tracker, &t).expect("first seen notifies");
        assert_eq!(first.kind, NotificationKind::FirstSeen);
        assert_eq!(first.ring_entered.as_deref(), Some("outer"));

        let t = approach(&mut tracker, 60, 48.4, 9_000.0);
        assert_matches!(
            policy.evaluate(&t),
            Decision::Suppress(SuppressReason::UpdateWithoutFlagChange)
        );

        // Descending into the inner ring fires it.
        let t = approach(&mut tracker, 120, 48.1, 2_000.0);
        let inner = step(&policy, &mut tracker, &t).expect("inner ring notifies");
        assert_eq!(inner.kind, NotificationKind::RingEntered);
        assert_eq!(inner.category.as_deref(), Some("inner"));

        // Drifting back out to the outer ring stays quiet.
        let t = approach(&mut tracker, 180, 48.5, 1_000.0);
        assert!(step(&policy, &mut tracker, &t).is_none());
    }

    #[test]
    fn inner_ring_first_blocks_outer_ring() {
        let policy = engine(PolicyConfig {
            range_rings: rings(),
            ..PolicyConfig::default()
        });
        assert_eq!(policy.rings_from("inner"), vec!["inner".to_string(), "outer".to_string()]);
        assert_eq!(policy.rings_from("outer"), vec!["outer".to_string()]);
        assert!(policy.rings_from("missing").is_empty());
    }

    #[test]
    fn ring_entry_still_honours_type_filters() {
        let policy = engine(PolicyConfig {
            range_rings: rings(),
            denied_types: vec!["RS41".into()],
            ..PolicyConfig::default()
        });
        let mut tracker = SondeTracker::new(TrackerConfig::default());
        approach(&mut tracker, 0, 50.0, 20_000.0);
        let t = approach(&mut tracker, 60, 48.1, 2_000.0);
        assert_matches!(policy.evaluate(&t), Decision::Suppress(SuppressReason::TypeDenied(_)));
    }

    fn landing(lat: f64) -> LandingPrediction {
        LandingPrediction {
            latitude: lat,
            longitude: 11.0,
            altitude: 500.0,
            landing_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn predicted_landing_in_ring_notifies_once_per_ring() {
        let policy = engine(PolicyConfig {
            range_rings: rings(),
            ..PolicyConfig::default()
        });
        let mut tracker = SondeTracker::new(TrackerConfig::default());
        let t = approach(&mut tracker, 0, 49.5, 20_000.0);
        let at = t.at;

        let event = assert_matches!(
            policy.evaluate_prediction(&t.record, &landing(48.5), at),
            Decision::Notify(e) => e
        );
        assert_eq!(event.kind, NotificationKind::PredictedLanding);
        assert_eq!(event.category.as_deref(), Some("prediction_outer"));
        assert!(event.body.contains("Range ring: outer"));
        assert_eq!(event.prediction.as_ref().map(|p| p.latitude), Some(48.5));
        policy.record_fired(&mut tracker, &event);

        let record = tracker.get("S1234567").unwrap().clone();
        assert!(record.notified_rings.is_empty());
        assert_matches!(
            policy.evaluate_prediction(&record, &landing(48.5), at),
            Decision::Suppress(SuppressReason::RingAlreadyNotified(r)) if r == "outer"
        );

        let event = assert_matches!(
            policy.evaluate_prediction(&record, &landing(48.05), at),
            Decision::Notify(e) => e
        );
        assert_eq!(event.category.as_deref(), Some("prediction_inner"));

        assert_matches!(
            policy.evaluate_prediction(&record, &landing(52.0), at),
            Decision::Suppress(SuppressReason::OutsideRangeRings { .. })
        );
    }

    #[test]
    fn prediction_without_rings_is_suppressed() {
        let policy = engine(PolicyConfig::default());
        let t = transition(Some("RS41"), 48.1, 5_000.0);
        assert_matches!(
            policy.evaluate_prediction(&t.record, &landing(48.0), t.at),
            Decision::Suppress(SuppressReason::NoRangeRings)
        );
    }

    #[test]
    fn suppress_reason_reads_well() {
        let reason = SuppressReason::TooFar {
            distance_m: 120_000.0,
            max_m: 50_000.0,
        };
        assert_eq!(reason.to_string(), "distance 120000 m exceeds 50000 m");
    }
}
