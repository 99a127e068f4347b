//! GET /health against a live daemon and against degraded components.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::MockBackend;
use http_body_util::BodyExt;
use sondenotify_daemon::health::router;
use sondenotify_daemon::{Daemon, HealthChecker, HealthState, TrackerHandle};
use tokio::sync::mpsc;
use tower::ServiceExt;

async fn get(app: axum::Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthy_daemon_returns_ok() {
    let (backend, _log) = MockBackend::succeeding("mock");
    let daemon = Daemon::start(common::config(), vec![backend])
        .await
        .expect("daemon starts");

    let app = router(daemon.health_checker(Duration::from_secs(1)));
    let response = get(app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["ingestion_alive"], true);
    assert_eq!(json["tracker_responsive"], true);
    assert_eq!(json["tracked_sondes"], 0);

    daemon.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stopped_tracker_and_listener_are_degraded() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let checker = HealthChecker::new(
        HealthState::default(),
        TrackerHandle::new(tx),
        Duration::from_millis(100),
    );

    let response = get(router(checker), "/health").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = body_json(response).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["ingestion_alive"], false);
    assert_eq!(json["tracker_responsive"], false);
    assert!(json["tracked_sondes"].is_null());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_tracker_times_out() {
    // Receiver kept alive but never read.
    let (tx, _rx) = mpsc::channel(1);
    let state = HealthState::default();
    let _alive = state.ingestion_guard();
    let checker = HealthChecker::new(state, TrackerHandle::new(tx), Duration::from_millis(500));

    let report = checker.check().await;
    assert!(report.ingestion_alive);
    assert!(!report.tracker_responsive);
    assert_eq!(report.status, "degraded");
}

#[tokio::test]
async fn health_server_binds_when_configured() {
    let mut config = common::config();
    config.health.bind = Some("127.0.0.1:0".into());
    let (backend, _log) = MockBackend::succeeding("mock");
    let daemon = Daemon::start(config, vec![backend]).await.expect("daemon starts");

    let addr = daemon.health_addr().expect("health server bound");
    assert!(addr.port() > 0);

    daemon.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (tx, _rx) = mpsc::channel(1);
    let checker = HealthChecker::new(
        HealthState::default(),
        TrackerHandle::new(tx),
        Duration::from_millis(100),
    );
    let response = get(router(checker), "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
