//! Task wiring and graceful shutdown.
//!
//! ```text
//! listener ──┐
//!            ├─► tracker task (tracker + policy) ──► delivery tasks ──► backends
//! sweeper  ──┘        └─► predictor (optional)
//! ```
//!
//! Shutdown order: stop intake (listener, sweeper, health server), let the
//! tracker apply what was already queued, then give in-flight deliveries a
//! bounded grace period before abandoning their retries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sondenotify_core::{CoreError, PolicyEngine, SondeTracker};
use sondenotify_events::{
    delivery, Backend, DeliveryError, DispatchReport, Dispatcher, NotificationBackend,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ConfigError, DaemonConfig};
use crate::engine::{Engine, Predictions, TrackerHandle};
use crate::health::{HealthChecker, HealthState};
use crate::prediction::{PredictError, TawhiriClient};
use crate::{listener, sweeper};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid notification policy: {0}")]
    Policy(#[from] CoreError),

    #[error("Invalid landing prediction settings: {0}")]
    Prediction(#[from] PredictError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] DeliveryError),

    #[error("Failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// How a shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Every in-flight delivery finished within the grace period.
    pub drained: bool,
}

/// A running daemon.
pub struct Daemon<B = Backend> {
    tracker: TrackerHandle,
    health: HealthState,
    dispatcher: Arc<Dispatcher<B>>,
    deliveries: TaskTracker,
    intake_cancel: CancellationToken,
    engine_stop: CancellationToken,
    intake: Vec<JoinHandle<()>>,
    engine: JoinHandle<()>,
    udp_addr: SocketAddr,
    health_addr: Option<SocketAddr>,
}

impl<B: NotificationBackend + 'static> Daemon<B> {
    /// Bind sockets and spawn every task.
    pub async fn start(config: DaemonConfig, backends: Vec<B>) -> Result<Self, DaemonError> {
        Self::start_inner(config, backends, None).await
    }

    /// Like [`start`](Self::start), also forwarding every finished
    /// [`DispatchReport`] to `reports`.
    pub async fn start_with_reports(
        config: DaemonConfig,
        backends: Vec<B>,
        reports: mpsc::UnboundedSender<DispatchReport>,
    ) -> Result<Self, DaemonError> {
        Self::start_inner(config, backends, Some(reports)).await
    }

    async fn start_inner(
        config: DaemonConfig,
        backends: Vec<B>,
        reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    ) -> Result<Self, DaemonError> {
        config.check()?;
        let udp_bind = config.udp_bind_addr().await?;
        let health_bind = config.health_bind_addr()?;

        let policy = PolicyEngine::new(config.policy.clone(), config.station)?;
        let dispatcher = Arc::new(
            Dispatcher::new(backends, config.retry.clone())
                .with_max_in_flight(config.dispatch.max_in_flight),
        );
        tracing::info!(
            backends = ?dispatcher.backend_names(),
            max_in_flight = dispatcher.max_in_flight(),
            "Notification backends ready"
        );

        let predictions = if config.prediction.enabled {
            let client = TawhiriClient::new(&config.prediction, delivery::http_client()?)?;
            tracing::info!(api_url = %config.prediction.api_url, "Landing predictions enabled");
            Some(Predictions {
                predictor: Arc::new(client),
                config: config.prediction.clone(),
                freshness: config.tracker.sweep_interval(),
            })
        } else {
            None
        };

        // Nothing is spawned until both sockets are bound.
        let socket = listener::bind(udp_bind).map_err(|source| DaemonError::Bind {
            what: "UDP listener",
            addr: udp_bind,
            source,
        })?;
        let udp_addr = socket.local_addr().map_err(|source| DaemonError::Bind {
            what: "UDP listener",
            addr: udp_bind,
            source,
        })?;

        let health_listener = match health_bind {
            Some(addr) => {
                let bound = TcpListener::bind(addr)
                    .await
                    .map_err(|source| DaemonError::Bind {
                        what: "health endpoint",
                        addr,
                        source,
                    })?;
                Some(bound)
            }
            None => None,
        };
        let health_addr = health_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok());

        let (tx, rx) = mpsc::channel(config.listener.queue_capacity);
        let tracker = TrackerHandle::new(tx);
        let health = HealthState::default();
        let deliveries = TaskTracker::new();
        let intake_cancel = CancellationToken::new();
        let engine_stop = CancellationToken::new();

        let mut engine = Engine::new(
            SondeTracker::new(config.tracker.clone()),
            policy,
            Arc::clone(&dispatcher),
            deliveries.clone(),
        );
        if let Some(reports) = reports {
            engine = engine.with_reports(reports);
        }
        if let Some(predictions) = predictions {
            engine = engine.with_predictions(predictions);
        }
        let engine = tokio::spawn(engine.run(rx, engine_stop.clone()));

        let mut intake = vec![
            tokio::spawn(listener::run(
                socket,
                tracker.clone(),
                health.ingestion_guard(),
                intake_cancel.clone(),
            )),
            tokio::spawn(sweeper::run(
                Duration::from_secs(config.tracker.sweep_interval_secs),
                tracker.clone(),
                intake_cancel.clone(),
            )),
        ];

        if let Some(listener) = health_listener {
            let checker = HealthChecker::new(
                health.clone(),
                tracker.clone(),
                config.health.check_timeout(),
            );
            intake.push(tokio::spawn(crate::health::serve(
                listener,
                checker,
                intake_cancel.clone(),
            )));
        }

        tracing::info!(%udp_addr, health = ?health_addr, "Daemon started");

        Ok(Self {
            tracker,
            health,
            dispatcher,
            deliveries,
            intake_cancel,
            engine_stop,
            intake,
            engine,
            udp_addr,
            health_addr,
        })
    }

    pub fn tracker(&self) -> TrackerHandle {
        self.tracker.clone()
    }

    pub fn health_state(&self) -> HealthState {
        self.health.clone()
    }

    /// A checker over this daemon's tasks, e.g. for mounting [`crate::health::router`].
    pub fn health_checker(&self, timeout: Duration) -> HealthChecker {
        HealthChecker::new(self.health.clone(), self.tracker.clone(), timeout)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Stop intake, drain the tracker queue and wait up to `grace` for
    /// in-flight deliveries. Retries still pending after `grace` are
    /// abandoned.
    pub async fn shutdown(self, grace: Duration) -> ShutdownSummary {
        tracing::info!(grace_secs = grace.as_secs(), "Shutting down");

        self.intake_cancel.cancel();
        for task in self.intake {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Intake task ended abnormally");
            }
        }

        self.engine_stop.cancel();
        drop(self.tracker);
        if let Err(e) = self.engine.await {
            tracing::error!(error = %e, "Tracker task ended abnormally");
        }

        self.deliveries.close();
        let pending = self.deliveries.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight deliveries");
        }

        let drained = tokio::time::timeout(grace, self.deliveries.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                pending = self.deliveries.len(),
                "Grace period elapsed, abandoning pending deliveries"
            );
            self.dispatcher.cancel();
            self.deliveries.wait().await;
        }

        tracing::info!(drained, "Shutdown complete");
        ShutdownSummary { drained }
    }
}
