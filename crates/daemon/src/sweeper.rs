//! Periodic expiry sweep.
//!
//! Sends a [`TrackerCommand::Sweep`](crate::engine::TrackerCommand) stamped
//! with wall-clock UTC on a fixed interval. The sweep itself runs inside the
//! tracker task.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::TrackerHandle;

/// Run the sweep loop until `cancel` fires or the tracker stops.
pub async fn run(period: Duration, tracker: TrackerHandle, cancel: CancellationToken) {
    tracing::info!(interval_secs = period.as_secs(), "Expiry sweeper started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can have expired yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Expiry sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                if tracker.sweep(Utc::now()).await.is_err() {
                    tracing::warn!("Tracker gone, expiry sweeper stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrackerCommand;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn sends_one_sweep_per_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Duration::from_secs(30),
            TrackerHandle::new(tx),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        task.await.expect("sweeper task");

        assert_matches!(rx.recv().await, Some(TrackerCommand::Sweep(_)));
        assert_matches!(rx.recv().await, Some(TrackerCommand::Sweep(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stops_when_tracker_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let task = tokio::spawn(run(
            Duration::from_millis(10),
            TrackerHandle::new(tx),
            CancellationToken::new(),
        ));
        task.await.expect("sweeper exits on its own");
    }
}
