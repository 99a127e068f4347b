//! Per-sonde lifecycle tracking.
//!
//! [`SondeTracker`] owns every [`SondeRecord`] and is the single writer of
//! lifecycle state. It is a plain synchronous structure; the daemon wraps it
//! in one task so that observations and sweeps are applied sequentially.
//!
//! ```text
//!   (unknown) --first obs--> Active --landing flag--> Landed
//!                              |  ^                      |
//!                     timeout  |  | reappeared           | timeout
//!                              v  |                      v
//!                             Expired <------------------+
//!                              |
//!                  retention   v
//!                          (evicted)
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::observation::SondeObservation;
use crate::policy::RingTrigger;
use crate::types::{SondeId, Timestamp};

/// Number of recent altitudes retained per sonde.
const ALTITUDE_HISTORY_LEN: usize = 5;

/// Minimum number of strictly decreasing altitudes to call a sonde descending.
const MIN_DESCENT_FRAMES: usize = 3;

/// Default silence before an active sonde is considered lost (10 minutes).
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 600;

/// Default time an expired record is kept before eviction (5 hours).
const DEFAULT_RETENTION_SECS: u64 = 5 * 60 * 60;

/// Default sweep cadence.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Upper bound for every configured duration (366 days).
pub const MAX_DURATION_SECS: u64 = 31_622_400;

// ---------------------------------------------------------------------------
// States and transitions
// ---------------------------------------------------------------------------

/// Lifecycle state of a tracked sonde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Landed,
    Expired,
}

/// A discrete lifecycle event for one sonde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    FirstSeen,
    Updated,
    Landed,
    Expired,
    Reappeared,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 5] = [
        TransitionKind::FirstSeen,
        TransitionKind::Updated,
        TransitionKind::Landed,
        TransitionKind::Expired,
        TransitionKind::Reappeared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::FirstSeen => "first_seen",
            TransitionKind::Updated => "updated",
            TransitionKind::Landed => "landed",
            TransitionKind::Expired => "expired",
            TransitionKind::Reappeared => "reappeared",
        }
    }

    /// Human-readable phrase used in rendered notifications.
    pub fn describe(&self) -> &'static str {
        match self {
            TransitionKind::FirstSeen => "new sonde detected",
            TransitionKind::Updated => "sonde updated",
            TransitionKind::Landed => "sonde landed",
            TransitionKind::Expired => "sonde lost",
            TransitionKind::Reappeared => "sonde reappeared",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle transition together with the record snapshot taken right
/// after it was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub kind: TransitionKind,
    /// When the transition happened: the observation time for live
    /// observations, the sweep time for sweeper-generated transitions.
    pub at: Timestamp,
    /// Whether the burst or landing flag differs from the previous snapshot.
    pub flags_changed: bool,
    pub record: SondeRecord,
}

// ---------------------------------------------------------------------------
// SondeRecord
// ---------------------------------------------------------------------------

/// Everything the tracker knows about one sonde.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SondeRecord {
    pub serial: SondeId,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub last_observation: SondeObservation,
    pub state: LifecycleState,
    pub observation_count: u64,
    /// Set while the record is `Expired`.
    pub expired_at: Option<Timestamp>,
    /// Range rings already notified for the sonde's position.
    pub notified_rings: BTreeSet<String>,
    /// Range rings already notified for the predicted landing point.
    pub notified_prediction_rings: BTreeSet<String>,
    altitude_history: VecDeque<f64>,
}

impl SondeRecord {
    fn new(observation: SondeObservation) -> Self {
        let mut altitude_history = VecDeque::with_capacity(ALTITUDE_HISTORY_LEN);
        altitude_history.push_back(observation.altitude);
        Self {
            serial: observation.serial.clone(),
            first_seen: observation.timestamp,
            last_seen: observation.timestamp,
            last_observation: observation,
            state: LifecycleState::Active,
            observation_count: 1,
            expired_at: None,
            notified_rings: BTreeSet::new(),
            notified_prediction_rings: BTreeSet::new(),
            altitude_history,
        }
    }

    pub fn notified(&self, trigger: RingTrigger) -> &BTreeSet<String> {
        match trigger {
            RingTrigger::Position => &self.notified_rings,
            RingTrigger::Prediction => &self.notified_prediction_rings,
        }
    }

    /// Recent altitudes, oldest first.
    pub fn altitudes(&self) -> impl Iterator<Item = f64> + '_ {
        self.altitude_history.iter().copied()
    }

    /// Strictly decreasing over the retained history, with enough frames.
    pub fn is_descending(&self) -> bool {
        self.altitude_history.len() >= MIN_DESCENT_FRAMES
            && self
                .altitude_history
                .iter()
                .zip(self.altitude_history.iter().skip(1))
                .all(|(a, b)| a > b)
    }

    /// Replace the snapshot with a newer observation.
    ///
    /// Returns whether the burst or landing flag changed.
    fn apply(&mut self, observation: SondeObservation) -> bool {
        let flags_changed = observation.burst != self.last_observation.burst
            || observation.landed != self.last_observation.landed;

        if self.altitude_history.len() == ALTITUDE_HISTORY_LEN {
            self.altitude_history.pop_front();
        }
        self.altitude_history.push_back(observation.altitude);

        self.last_seen = observation.timestamp;
        self.last_observation = observation;
        self.observation_count += 1;
        flags_changed
    }

    fn check_invariants(&self, key: &str) -> Result<(), CoreError> {
        let violation = |detail: String| CoreError::Invariant {
            serial: key.to_string(),
            detail,
        };

        if self.serial != key {
            return Err(violation(format!("record keyed under foreign serial {}", self.serial)));
        }
        if self.last_seen < self.first_seen {
            return Err(violation("last_seen precedes first_seen".into()));
        }
        if (self.state == LifecycleState::Expired) != self.expired_at.is_some() {
            return Err(violation(format!(
                "state {:?} inconsistent with expired_at {:?}",
                self.state, self.expired_at
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Best-effort landing inference from descent plus silence.
///
/// The explicit landing flag on an observation is always authoritative;
/// this only covers sondes that go quiet near the ground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LandingInference {
    /// Silence required before a descending sonde is assumed down.
    #[validate(range(min = 1, max = 31_622_400))]
    pub silence_secs: u64,
    /// Last reported altitude must be at or below this.
    #[validate(range(min = 0.0))]
    pub max_altitude_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrackerConfig {
    #[validate(range(min = 1, max = 31_622_400))]
    pub sweep_interval_secs: u64,
    #[validate(range(min = 1, max = 31_622_400))]
    pub inactivity_timeout_secs: u64,
    #[validate(range(min = 1, max = 31_622_400))]
    pub retention_secs: u64,
    #[validate(nested)]
    pub landing: Option<LandingInference>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            landing: None,
        }
    }
}

impl TrackerConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        seconds(self.inactivity_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        seconds(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        seconds(self.sweep_interval_secs)
    }
}

/// Saturating conversion; values past chrono's range mean "forever".
pub(crate) fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

// ---------------------------------------------------------------------------
// SondeTracker
// ---------------------------------------------------------------------------

/// Owner of all sonde records.
#[derive(Debug)]
pub struct SondeTracker {
    config: TrackerConfig,
    records: HashMap<SondeId, SondeRecord>,
}

impl SondeTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Apply one observation and return the resulting transition, if any.
    ///
    /// Observations older than the record's `last_seen` are counted but
    /// never move the snapshot or the lifecycle state, so late UDP
    /// datagrams cannot regress a sonde.
    pub fn observe(&mut self, observation: SondeObservation) -> Option<Transition> {
        let at = observation.timestamp;
        let serial = observation.serial.clone();

        let Some(record) = self.records.get_mut(&serial) else {
            return Some(self.start_record(observation));
        };

        if let Err(e) = record.check_invariants(&serial) {
            tracing::error!(serial = %serial, error = %e, "Tracker invariant violated, resetting record");
            return Some(self.start_record(observation));
        }

        if at < record.last_seen {
            record.observation_count += 1;
            tracing::debug!(
                serial = %serial,
                observed_at = %at,
                last_seen = %record.last_seen,
                "Out-of-order observation ignored for state",
            );
            return None;
        }

        let (kind, flags_changed) = match record.state {
            LifecycleState::Active => {
                let flags_changed = record.apply(observation);
                if record.last_observation.landed {
                    record.state = LifecycleState::Landed;
                    (TransitionKind::Landed, flags_changed)
                } else {
                    (TransitionKind::Updated, flags_changed)
                }
            }
            LifecycleState::Landed => (TransitionKind::Updated, record.apply(observation)),
            LifecycleState::Expired => {
                let expired_at = record.expired_at.unwrap_or(record.last_seen);
                if at - expired_at > self.config.retention() {
                    tracing::info!(serial = %serial, "Sonde heard again after retention window, treating as new");
                    return Some(self.start_record(observation));
                }
                let flags_changed = record.apply(observation);
                record.state = LifecycleState::Active;
                record.expired_at = None;
                (TransitionKind::Reappeared, flags_changed)
            }
        };

        if kind != TransitionKind::Updated {
            tracing::info!(serial = %serial, transition = %kind, "Sonde lifecycle transition");
        }

        Some(Transition {
            kind,
            at,
            flags_changed,
            record: record.clone(),
        })
    }

    /// Expire silent sondes, infer landings and evict stale records.
    ///
    /// Transitions are returned sorted by serial so repeated sweeps over
    /// the same state are deterministic.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<Transition> {
        let timeout = self.config.inactivity_timeout();
        let retention = self.config.retention();
        let landing = self.config.landing.clone();

        let mut transitions = Vec::new();
        let mut evicted = Vec::new();

        for (serial, record) in self.records.iter_mut() {
            let silence = now - record.last_seen;

            match record.state {
                LifecycleState::Active | LifecycleState::Landed if silence > timeout => {
                    record.state = LifecycleState::Expired;
                    record.expired_at = Some(now);
                    tracing::info!(
                        serial = %serial,
                        silent_secs = silence.num_seconds(),
                        "Sonde expired after inactivity",
                    );
                    transitions.push(Transition {
                        kind: TransitionKind::Expired,
                        at: now,
                        flags_changed: false,
                        record: record.clone(),
                    });
                }
                LifecycleState::Active => {
                    let Some(rule) = landing.as_ref() else {
                        continue;
                    };
                    if silence >= seconds(rule.silence_secs)
                        && record.is_descending()
                        && record.last_observation.altitude <= rule.max_altitude_m
                    {
                        record.state = LifecycleState::Landed;
                        tracing::info!(
                            serial = %serial,
                            altitude = record.last_observation.altitude,
                            "Sonde landing inferred from descent and silence",
                        );
                        transitions.push(Transition {
                            kind: TransitionKind::Landed,
                            at: now,
                            flags_changed: false,
                            record: record.clone(),
                        });
                    }
                }
                LifecycleState::Expired => {
                    let expired_at = record.expired_at.unwrap_or(record.last_seen);
                    if now - expired_at >= retention {
                        evicted.push(serial.clone());
                    }
                }
                LifecycleState::Landed => {}
            }
        }

        for serial in &evicted {
            self.records.remove(serial);
            tracing::info!(serial = %serial, "Evicted sonde after retention window");
        }

        transitions.sort_by(|a, b| a.record.serial.cmp(&b.record.serial));
        transitions
    }

    pub fn get(&self, serial: &str) -> Option<&SondeRecord> {
        self.records.get(serial)
    }

    /// Remember that `rings` fired for `serial` so they never fire again
    /// for this record. Unknown serials are ignored.
    pub fn mark_rings_notified<I>(&mut self, serial: &str, trigger: RingTrigger, rings: I)
    where
        I: IntoIterator<Item = String>,
    {
        let Some(record) = self.records.get_mut(serial) else {
            return;
        };
        let notified = match trigger {
            RingTrigger::Position => &mut record.notified_rings,
            RingTrigger::Prediction => &mut record.notified_prediction_rings,
        };
        notified.extend(rings);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copies of every record, sorted by serial.
    pub fn snapshot(&self) -> Vec<SondeRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.serial.cmp(&b.serial));
        records
    }

    fn start_record(&mut self, observation: SondeObservation) -> Transition {
        let at = observation.timestamp;
        let record = SondeRecord::new(observation);
        tracing::info!(
            serial = %record.serial,
            model = record.last_observation.model.as_deref().unwrap_or("unknown"),
            "Got new sonde",
        );
        self.records.insert(record.serial.clone(), record.clone());
        Transition {
            kind: TransitionKind::FirstSeen,
            at,
            flags_changed: false,
            record,
        }
    }

    #[cfg(test)]
    fn corrupt(&mut self, serial: &str) {
        if let Some(record) = self.records.get_mut(serial) {
            record.first_seen = record.last_seen + Duration::hours(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
