//! The tracker task.
//!
//! A single task owns the [`SondeTracker`] and the [`PolicyEngine`]. The
//! listener and the sweeper talk to it only through [`TrackerCommand`]s, so
//! observations and sweeps are applied one at a time in admission order and
//! no record is ever seen half-updated. Accepted notifications are handed to
//! the dispatcher on separate tasks so slow backends never hold up the
//! queue; when the dispatcher has no free delivery slot the notification is
//! dropped with a warning.
//!
//! With predictions enabled every sweep also asks the predictor for the
//! landing point of each fresh sonde. Answers come back into this task,
//! which checks them against the range rings like any other input.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sondenotify_core::types::{SondeId, Timestamp};
use sondenotify_core::{
    Decision, LandingPrediction, LifecycleState, NotificationEvent, PolicyEngine,
    PredictionConfig, SondeObservation, SondeRecord, SondeTracker, Transition,
};
use sondenotify_events::{Backend, DispatchReport, Dispatcher, NotificationBackend};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::prediction::{LandingPredictor, PredictError};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TrackerCommand {
    Observe(SondeObservation),
    Sweep(Timestamp),
    Status(oneshot::Sender<TrackerStatus>),
    Snapshot(oneshot::Sender<Vec<SondeRecord>>),
}

/// Record counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStatus {
    pub tracked: usize,
    pub active: usize,
    pub landed: usize,
    pub expired: usize,
}

/// Cloneable sender side of the tracker queue.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerCommand>,
}

/// The tracker task has stopped.
#[derive(Debug, thiserror::Error)]
#[error("tracker task is not running")]
pub struct TrackerClosed;

impl TrackerHandle {
    pub fn new(tx: mpsc::Sender<TrackerCommand>) -> Self {
        Self { tx }
    }

    pub async fn observe(&self, observation: SondeObservation) -> Result<(), TrackerClosed> {
        self.send(TrackerCommand::Observe(observation)).await
    }

    pub async fn sweep(&self, now: Timestamp) -> Result<(), TrackerClosed> {
        self.send(TrackerCommand::Sweep(now)).await
    }

    pub async fn status(&self) -> Result<TrackerStatus, TrackerClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Status(reply)).await?;
        rx.await.map_err(|_| TrackerClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<SondeRecord>, TrackerClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| TrackerClosed)
    }

    async fn send(&self, command: TrackerCommand) -> Result<(), TrackerClosed> {
        self.tx.send(command).await.map_err(|_| TrackerClosed)
    }
}

// ---------------------------------------------------------------------------
// Predictions
// ---------------------------------------------------------------------------

/// Landing prediction settings for the tracker task.
pub struct Predictions {
    pub predictor: Arc<dyn LandingPredictor>,
    pub config: PredictionConfig,
    /// Only sondes heard this recently are predicted.
    pub freshness: chrono::Duration,
}

#[derive(Debug)]
struct PredictionOutcome {
    serial: SondeId,
    at: Timestamp,
    result: Result<LandingPrediction, PredictError>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<B = Backend> {
    tracker: SondeTracker,
    policy: PolicyEngine,
    dispatcher: Arc<Dispatcher<B>>,
    deliveries: TaskTracker,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    predictions: Option<Predictions>,
    pending_predictions: HashSet<SondeId>,
    prediction_cancel: CancellationToken,
    outcomes_tx: mpsc::UnboundedSender<PredictionOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<PredictionOutcome>,
}

impl<B: NotificationBackend + 'static> Engine<B> {
    pub fn new(
        tracker: SondeTracker,
        policy: PolicyEngine,
        dispatcher: Arc<Dispatcher<B>>,
        deliveries: TaskTracker,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            tracker,
            policy,
            dispatcher,
            deliveries,
            reports: None,
            predictions: None,
            pending_predictions: HashSet::new(),
            prediction_cancel: CancellationToken::new(),
            outcomes_tx,
            outcomes_rx,
        }
    }

    /// Forward every finished [`DispatchReport`] to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<DispatchReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn with_predictions(mut self, predictions: Predictions) -> Self {
        self.predictions = Some(predictions);
        self
    }

    /// Process commands until every sender is gone or `stop` fires.
    ///
    /// On `stop` the queue is closed and whatever was already admitted is
    /// still applied. Outstanding predictions are cancelled.
    pub async fn run(mut self, mut rx: mpsc::Receiver<TrackerCommand>, stop: CancellationToken) {
        tracing::info!("Tracker started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(outcome) = self.outcomes_rx.recv() => self.apply_prediction(outcome),
                _ = stop.cancelled() => {
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        self.handle(command);
                    }
                    break;
                }
            }
        }

        self.prediction_cancel.cancel();
        tracing::info!(tracked = self.tracker.len(), "Tracker stopped");
    }

    pub fn handle(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Observe(observation) => {
                if let Some(transition) = self.tracker.observe(observation) {
                    self.route(transition);
                }
            }
            TrackerCommand::Sweep(now) => {
                let transitions = self.tracker.sweep(now);
                tracing::debug!(
                    transitions = transitions.len(),
                    tracked = self.tracker.len(),
                    "Sweep complete"
                );
                for transition in transitions {
                    self.route(transition);
                }
                self.request_predictions(now);
            }
            TrackerCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            TrackerCommand::Snapshot(reply) => {
                let _ = reply.send(self.tracker.snapshot());
            }
        }
    }

    fn status(&self) -> TrackerStatus {
        let mut status = TrackerStatus::default();
        for record in self.tracker.snapshot() {
            status.tracked += 1;
            match record.state {
                LifecycleState::Active => status.active += 1,
                LifecycleState::Landed => status.landed += 1,
                LifecycleState::Expired => status.expired += 1,
            }
        }
        status
    }

    /// Policy decision, then hand-off to the dispatcher.
    fn route(&mut self, transition: Transition) {
        match self.policy.evaluate(&transition) {
            Decision::Notify(event) => self.notify(*event),
            Decision::Suppress(reason) => {
                tracing::debug!(
                    serial = %transition.record.serial,
                    transition = %transition.kind,
                    reason = %reason,
                    "Notification suppressed"
                );
            }
        }
    }

    fn notify(&mut self, event: NotificationEvent) {
        self.policy.record_fired(&mut self.tracker, &event);

        if self.deliveries.is_closed() {
            tracing::warn!(
                serial = %event.serial,
                kind = %event.kind,
                "Shutting down, notification dropped"
            );
            return;
        }

        let Some(slot) = self.dispatcher.try_admit() else {
            tracing::warn!(
                serial = %event.serial,
                kind = %event.kind,
                in_flight = self.dispatcher.in_flight(),
                "Too many deliveries in flight, notification dropped"
            );
            return;
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let reports = self.reports.clone();
        self.deliveries.spawn(async move {
            let _slot = slot;
            let report = dispatcher.dispatch(event).await;
            tracing::debug!(
                serial = %report.serial,
                delivered = report.delivered(),
                backends = report.backends.len(),
                "Dispatch finished"
            );
            if let Some(tx) = reports {
                let _ = tx.send(report);
            }
        });
    }

    /// Ask for a landing prediction for every sonde that is due one and has
    /// no request outstanding.
    fn request_predictions(&mut self, now: Timestamp) {
        let Some(predictions) = &self.predictions else {
            return;
        };

        for record in self.tracker.snapshot() {
            if self.pending_predictions.contains(&record.serial) {
                continue;
            }
            let Some(query) = predictions
                .config
                .query_for(&record, now, predictions.freshness)
            else {
                continue;
            };

            self.pending_predictions.insert(record.serial.clone());
            let predictor = Arc::clone(&predictions.predictor);
            let tx = self.outcomes_tx.clone();
            let cancel = self.prediction_cancel.clone();
            let serial = record.serial;
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    result = predictor.predict(&query) => result,
                };
                let _ = tx.send(PredictionOutcome {
                    serial,
                    at: now,
                    result,
                });
            });
        }
    }

    fn apply_prediction(&mut self, outcome: PredictionOutcome) {
        self.pending_predictions.remove(&outcome.serial);

        let prediction = match outcome.result {
            Ok(prediction) => prediction,
            Err(e) => {
                tracing::warn!(serial = %outcome.serial, error = %e, "Landing prediction failed");
                return;
            }
        };

        let Some(record) = self.tracker.get(&outcome.serial) else {
            tracing::debug!(serial = %outcome.serial, "Sonde evicted before its prediction arrived");
            return;
        };

        match self.policy.evaluate_prediction(record, &prediction, outcome.at) {
            Decision::Notify(event) => {
                tracing::info!(
                    serial = %outcome.serial,
                    latitude = prediction.latitude,
                    longitude = prediction.longitude,
                    ring = event.ring_entered.as_deref().unwrap_or("none"),
                    "Predicted landing inside range ring"
                );
                self.notify(*event);
            }
            Decision::Suppress(reason) => {
                tracing::debug!(serial = %outcome.serial, reason = %reason, "Prediction not notified");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use sondenotify_core::{PolicyConfig, PredictionQuery, RangeRing, StationPosition};
    use sondenotify_events::delivery::{DeliveryError, LogBackend, LogConfig};
    use sondenotify_events::{DeliveryOutcome, RetryPolicy};

    type Reports = mpsc::UnboundedReceiver<DispatchReport>;

    fn engine_with<B: NotificationBackend + 'static>(
        backends: Vec<B>,
        policy: PolicyEngine,
        max_in_flight: usize,
    ) -> (Engine<B>, TaskTracker, Arc<Dispatcher<B>>, Reports) {
        let deliveries = TaskTracker::new();
        let dispatcher = Arc::new(
            Dispatcher::new(backends, RetryPolicy::default()).with_max_in_flight(max_in_flight),
        );
        let (tx, reports) = mpsc::unbounded_channel();
        let engine = Engine::new(
            SondeTracker::new(Default::default()),
            policy,
            Arc::clone(&dispatcher),
            deliveries.clone(),
        )
        .with_reports(tx);
        (engine, deliveries, dispatcher, reports)
    }

    fn engine() -> (Engine, TaskTracker, Reports) {
        let (engine, deliveries, _, reports) = engine_with(
            vec![Backend::Log(LogBackend::new("log".into(), LogConfig::default()))],
            PolicyEngine::new(PolicyConfig::default(), None).unwrap(),
            64,
        );
        (engine, deliveries, reports)
    }

    fn observation(serial: &str, minute: u32, landed: bool) -> SondeObservation {
        SondeObservation {
            serial: serial.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            latitude: 48.1,
            longitude: 11.5,
            altitude: 900.0,
            frame: None,
            model: Some("RS41".into()),
            frequency_mhz: None,
            vertical_velocity: None,
            horizontal_velocity: None,
            heading: None,
            temperature: None,
            burst: false,
            landed,
        }
    }

    fn drain(reports: &mut Reports) -> Vec<DispatchReport> {
        let mut out = Vec::new();
        while let Ok(report) = reports.try_recv() {
            out.push(report);
        }
        out
    }

    #[tokio::test]
    async fn status_counts_records_by_state() {
        let (mut engine, deliveries, mut reports) = engine();
        engine.handle(TrackerCommand::Observe(observation("A", 0, false)));
        engine.handle(TrackerCommand::Observe(observation("B", 0, false)));
        engine.handle(TrackerCommand::Observe(observation("B", 1, true)));

        let (reply, rx) = oneshot::channel();
        engine.handle(TrackerCommand::Status(reply));
        assert_eq!(
            rx.await.unwrap(),
            TrackerStatus {
                tracked: 2,
                active: 1,
                landed: 1,
                expired: 0,
            }
        );

        // Both silent for more than the default ten minutes.
        engine.handle(TrackerCommand::Sweep(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 11, 30).unwrap(),
        ));
        let (reply, rx) = oneshot::channel();
        engine.handle(TrackerCommand::Status(reply));
        assert_eq!(rx.await.unwrap().expired, 2);

        deliveries.close();
        deliveries.wait().await;

        // FirstSeen A, FirstSeen B, Landed B. Expired is not in the default set.
        let reports = drain(&mut reports);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.all_delivered()));
    }

    #[tokio::test]
    async fn run_applies_queued_commands_after_stop() {
        let (engine, deliveries, mut reports) = engine();
        let (tx, rx) = mpsc::channel(8);
        let handle = TrackerHandle::new(tx);
        let stop = CancellationToken::new();

        handle.observe(observation("A", 0, false)).await.unwrap();
        handle.observe(observation("B", 0, false)).await.unwrap();
        stop.cancel();
        engine.run(rx, stop).await;

        assert!(handle.observe(observation("C", 0, false)).await.is_err());

        deliveries.close();
        deliveries.wait().await;
        assert_eq!(drain(&mut reports).len(), 2);
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl NotificationBackend for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn deliveries_beyond_the_cap_are_dropped() {
        let (mut engine, deliveries, dispatcher, mut reports) = engine_with(
            vec![Hanging],
            PolicyEngine::new(PolicyConfig::default(), None).unwrap(),
            2,
        );

        for serial in ["A", "B", "C", "D"] {
            engine.handle(TrackerCommand::Observe(observation(serial, 0, false)));
        }
        assert_eq!(deliveries.len(), 2);
        assert_eq!(dispatcher.in_flight(), 2);

        dispatcher.cancel();
        deliveries.close();
        deliveries.wait().await;
        assert_eq!(dispatcher.in_flight(), 0);

        let reports = drain(&mut reports);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| matches!(
            r.get("hanging").map(|b| &b.outcome),
            Some(DeliveryOutcome::Abandoned { .. })
        )));
    }

    struct FixedPredictor {
        landing: LandingPrediction,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LandingPredictor for FixedPredictor {
        async fn predict(&self, query: &PredictionQuery) -> Result<LandingPrediction, PredictError> {
            assert!(query.descending);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.landing.clone())
        }
    }

    fn descending(serial: &str, secs: i64, altitude: f64) -> SondeObservation {
        SondeObservation {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            latitude: 49.5,
            altitude,
            ..observation(serial, 0, false)
        }
    }

    #[tokio::test]
    async fn predicted_landing_in_ring_notifies_once() {
        let station = StationPosition {
            latitude: 48.0,
            longitude: 11.5,
            altitude_m: 0.0,
        };
        let policy = PolicyEngine::new(
            PolicyConfig {
                range_rings: vec![RangeRing {
                    name: "home".into(),
                    radius_km: 20.0,
                    max_altitude_m: 5_000.0,
                }],
                ..PolicyConfig::default()
            },
            Some(station),
        )
        .unwrap();
        let predictor = Arc::new(FixedPredictor {
            landing: LandingPrediction {
                latitude: 48.05,
                longitude: 11.5,
                altitude: 520.0,
                landing_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 40, 0).unwrap(),
            },
            calls: AtomicUsize::new(0),
        });

        let (engine, deliveries, _, mut reports) = engine_with(
            vec![Backend::Log(LogBackend::new("log".into(), LogConfig::default()))],
            policy,
            64,
        );
        let mut engine = engine.with_predictions(Predictions {
            predictor: predictor.clone(),
            config: PredictionConfig {
                enabled: true,
                ..PredictionConfig::default()
            },
            freshness: chrono::Duration::seconds(60),
        });

        // Far outside the ring: nothing about the sonde itself notifies.
        for (secs, altitude) in [(0, 12_000.0), (1, 11_500.0), (2, 11_000.0)] {
            engine.handle(TrackerCommand::Observe(descending("S1", secs, altitude)));
        }

        let sweep_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        engine.handle(TrackerCommand::Sweep(sweep_at));
        // A second sweep while the first request is outstanding is a no-op.
        engine.handle(TrackerCommand::Sweep(sweep_at));
        let outcome = engine.outcomes_rx.recv().await.expect("prediction outcome");
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
        engine.apply_prediction(outcome);

        let record = engine.tracker.get("S1").unwrap();
        assert!(record.notified_prediction_rings.contains("home"));
        assert!(record.notified_rings.is_empty());

        // The same prediction again stays quiet.
        engine.handle(TrackerCommand::Sweep(sweep_at));
        let outcome = engine.outcomes_rx.recv().await.expect("prediction outcome");
        engine.apply_prediction(outcome);
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);

        deliveries.close();
        deliveries.wait().await;
        let reports = drain(&mut reports);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].serial, "S1");
    }

    #[tokio::test]
    async fn failed_prediction_is_retried_on_next_sweep() {
        let (mut engine, ..) = engine_with(
            vec![Backend::Log(LogBackend::new("log".into(), LogConfig::default()))],
            PolicyEngine::new(PolicyConfig::default(), None).unwrap(),
            64,
        );
        engine.pending_predictions.insert("S1".into());
        engine.apply_prediction(PredictionOutcome {
            serial: "S1".into(),
            at: Utc::now(),
            result: Err(PredictError::HttpStatus(502)),
        });
        assert!(engine.pending_predictions.is_empty());
    }
}
