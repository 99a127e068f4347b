//! Fan-out of notifications to every configured backend.
//!
//! [`Dispatcher::dispatch`] delivers one event to all backends concurrently.
//! Each backend gets its own bounded retry loop with exponential backoff and
//! a per-call timeout, so a slow or failing backend never delays the others.
//! Cancelling the dispatcher abandons pending retries; in-flight calls are
//! dropped at their next await point.
//!
//! The number of events being delivered at once is capped. Callers reserve a
//! slot with [`Dispatcher::try_admit`] before spawning a delivery and drop
//! the event when none is free, so a long outage cannot pile up retries.

use std::sync::Arc;

use sondenotify_core::NotificationEvent;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delivery::{Backend, DeliveryError, NotificationBackend};
use crate::retry::RetryPolicy;

/// Default cap on events being delivered concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Final result of delivering one event to one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Every attempt failed. `error` is the last failure.
    Failed { attempts: u32, error: String },
    /// Shutdown cancelled the remaining attempts.
    Abandoned { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts }
            | DeliveryOutcome::Failed { attempts, .. }
            | DeliveryOutcome::Abandoned { attempts } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReport {
    pub backend: String,
    pub outcome: DeliveryOutcome,
    /// One entry per failed attempt, oldest first.
    pub failures: Vec<String>,
}

/// Per-backend results, in backend configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: Uuid,
    pub serial: String,
    pub backends: Vec<BackendReport>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.backends
            .iter()
            .filter(|r| r.outcome.is_delivered())
            .count()
    }

    pub fn all_delivered(&self) -> bool {
        self.delivered() == self.backends.len()
    }

    pub fn get(&self, backend: &str) -> Option<&BackendReport> {
        self.backends.iter().find(|r| r.backend == backend)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Delivers notifications to a fixed set of backends.
pub struct Dispatcher<B = Backend> {
    backends: Vec<Arc<B>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
}

impl<B: NotificationBackend + 'static> Dispatcher<B> {
    pub fn new(backends: Vec<B>, retry: RetryPolicy) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            retry,
            cancel: CancellationToken::new(),
            slots: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Cap concurrent deliveries at `max` events (at least one).
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        let max = max.max(1);
        self.slots = Arc::new(Semaphore::new(max));
        self.max_in_flight = max;
        self
    }

    /// Reserve a delivery slot, held until the permit is dropped.
    ///
    /// `None` when `max_in_flight` events are already being delivered.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Abandon every pending and future retry.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver `event` to every backend concurrently and wait for all of
    /// them to finish, fail or be abandoned.
    pub async fn dispatch(&self, event: NotificationEvent) -> DispatchReport {
        let event = Arc::new(event);
        let mut set = JoinSet::new();

        for (index, backend) in self.backends.iter().enumerate() {
            let backend = Arc::clone(backend);
            let event = Arc::clone(&event);
            let retry = self.retry.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let report = deliver_with_retry(backend.as_ref(), &event, &retry, &cancel).await;
                (index, report)
            });
        }

        let mut reports: Vec<Option<BackendReport>> = vec![None; self.backends.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => {
                    tracing::error!(serial = %event.serial, error = %e, "Delivery task panicked");
                }
            }
        }

        let backends = reports
            .into_iter()
            .zip(&self.backends)
            .map(|(report, backend)| {
                report.unwrap_or_else(|| BackendReport {
                    backend: backend.name().to_string(),
                    outcome: DeliveryOutcome::Failed {
                        attempts: 0,
                        error: "delivery task panicked".into(),
                    },
                    failures: Vec::new(),
                })
            })
            .collect();

        DispatchReport {
            event_id: event.id,
            serial: event.serial.clone(),
            backends,
        }
    }
}

/// Retry loop for one backend.
async fn deliver_with_retry<B: NotificationBackend + ?Sized>(
    backend: &B,
    event: &NotificationEvent,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> BackendReport {
    let name = backend.name().to_string();
    let call_timeout = retry.call_timeout();
    let mut delay = retry.base_delay().min(retry.max_delay());
    let mut failures: Vec<String> = Vec::new();

    for attempt in 1..=retry.max_attempts {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return abandoned(name, event, attempt - 1, failures),
            r = tokio::time::timeout(call_timeout, backend.send(event)) => {
                r.unwrap_or_else(|_| Err(DeliveryError::Timeout(call_timeout)))
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    backend = %name,
                    serial = %event.serial,
                    kind = %event.kind,
                    attempt,
                    "Notification delivered"
                );
                return BackendReport {
                    backend: name,
                    outcome: DeliveryOutcome::Delivered { attempts: attempt },
                    failures,
                };
            }
            Err(e) => {
                tracing::warn!(
                    backend = %name,
                    serial = %event.serial,
                    attempt,
                    max_attempts = retry.max_attempts,
                    error = %e,
                    "Delivery attempt failed"
                );
                failures.push(e.to_string());
            }
        }

        if attempt < retry.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return abandoned(name, event, attempt, failures),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = retry.next_delay(delay);
        }
    }

    let error = failures.last().cloned().unwrap_or_default();
    tracing::error!(
        backend = %name,
        serial = %event.serial,
        attempts = retry.max_attempts,
        error = %error,
        "Delivery failed after all retries"
    );
    BackendReport {
        backend: name,
        outcome: DeliveryOutcome::Failed {
            attempts: retry.max_attempts,
            error,
        },
        failures,
    }
}

fn abandoned(
    name: String,
    event: &NotificationEvent,
    attempts: u32,
    failures: Vec<String>,
) -> BackendReport {
    tracing::warn!(
        backend = %name,
        serial = %event.serial,
        attempts,
        "Delivery abandoned on shutdown"
    );
    BackendReport {
        backend: name,
        outcome: DeliveryOutcome::Abandoned { attempts },
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{LogBackend, LogConfig};
    use crate::testing;
    use sondenotify_core::TransitionKind;

    #[tokio::test]
    async fn log_backend_delivers_first_try() {
        let dispatcher = Dispatcher::new(
            vec![Backend::Log(LogBackend::new("log".into(), LogConfig::default()))],
            RetryPolicy::default(),
        );
        let report = dispatcher
            .dispatch(testing::event("S1", TransitionKind::Landed))
            .await;
        assert_eq!(report.serial, "S1");
        assert_eq!(
            report.get("log").map(|r| &r.outcome),
            Some(&DeliveryOutcome::Delivered { attempts: 1 })
        );
        assert!(report.all_delivered());
    }

    #[tokio::test]
    async fn no_backends_is_an_empty_report() {
        let dispatcher: Dispatcher = Dispatcher::new(vec![], RetryPolicy::default());
        let report = dispatcher
            .dispatch(testing::event("S1", TransitionKind::FirstSeen))
            .await;
        assert!(report.backends.is_empty());
        assert!(report.all_delivered());
    }

    #[test]
    fn admission_is_capped_until_a_slot_frees() {
        let dispatcher: Dispatcher = Dispatcher::new(vec![], RetryPolicy::default())
            .with_max_in_flight(2);
        let first = dispatcher.try_admit().expect("slot");
        let _second = dispatcher.try_admit().expect("slot");
        assert_eq!(dispatcher.in_flight(), 2);
        assert!(dispatcher.try_admit().is_none());

        drop(first);
        assert_eq!(dispatcher.in_flight(), 1);
        assert!(dispatcher.try_admit().is_some());
    }

    #[test]
    fn zero_cap_still_admits_one() {
        let dispatcher: Dispatcher = Dispatcher::new(vec![], RetryPolicy::default())
            .with_max_in_flight(0);
        assert_eq!(dispatcher.max_in_flight(), 1);
        let _slot = dispatcher.try_admit().expect("slot");
        assert!(dispatcher.try_admit().is_none());
    }

    #[test]
    fn outcome_attempts_accessor() {
        assert_eq!(DeliveryOutcome::Abandoned { attempts: 2 }.attempts(), 2);
        assert!(!DeliveryOutcome::Failed {
            attempts: 4,
            error: "x".into()
        }
        .is_delivered());
    }
}
