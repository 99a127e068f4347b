//! Liveness reporting.
//!
//! [`HealthChecker::check`] answers two questions: is the UDP listener still
//! running, and does the tracker task answer a status request in time.
//! [`router`] exposes the answer as `GET /health`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::engine::TrackerHandle;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared liveness flags.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    ingestion_alive: Arc<AtomicBool>,
}

impl HealthState {
    pub fn ingestion_alive(&self) -> bool {
        self.ingestion_alive.load(Ordering::Acquire)
    }

    /// Marks ingestion alive until the guard is dropped, including on panic.
    pub fn ingestion_guard(&self) -> IngestionGuard {
        self.ingestion_alive.store(true, Ordering::Release);
        IngestionGuard {
            flag: Arc::clone(&self.ingestion_alive),
        }
    }
}

pub struct IngestionGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for IngestionGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Health check response payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub ingestion_alive: bool,
    pub tracker_responsive: bool,
    /// Absent when the tracker did not answer.
    pub tracked_sondes: Option<usize>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.ingestion_alive && self.tracker_responsive
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    state: HealthState,
    tracker: TrackerHandle,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(state: HealthState, tracker: TrackerHandle, timeout: Duration) -> Self {
        Self {
            state,
            tracker,
            timeout,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let tracked_sondes = match tokio::time::timeout(self.timeout, self.tracker.status()).await {
            Ok(Ok(status)) => Some(status.tracked),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Health check: tracker unavailable");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Health check: tracker did not answer");
                None
            }
        };
        let ingestion_alive = self.state.ingestion_alive();
        let tracker_responsive = tracked_sondes.is_some();

        HealthReport {
            status: if ingestion_alive && tracker_responsive {
                "ok"
            } else {
                "degraded"
            },
            version: env!("CARGO_PKG_VERSION"),
            ingestion_alive,
            tracker_responsive,
            tracked_sondes,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// GET /health -- 200 when healthy, 503 when degraded.
async fn health_check(State(checker): State<Arc<HealthChecker>>) -> (StatusCode, Json<HealthReport>) {
    let report = checker.check().await;
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

pub fn router(checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(Arc::new(checker))
        .layer(TraceLayer::new_for_http())
}

/// Serve the health router until `cancel` fires.
pub async fn serve(listener: TcpListener, checker: HealthChecker, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "Health endpoint listening"),
        Err(e) => tracing::warn!(error = %e, "Health endpoint address unknown"),
    }

    let result = axum::serve(listener, router(checker))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "Health endpoint failed");
    }
}
