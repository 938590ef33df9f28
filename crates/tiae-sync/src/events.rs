//! Reconciliation events for an out-of-band reconciler.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A post-commit action gave up. The database stays the source of truth;
/// the named target needs reconciling against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationNeeded {
    pub target: String,
    pub attempts: u32,
    pub last_error: String,
    pub incident_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReconciliationNeeded>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationNeeded> {
        self.tx.subscribe()
    }

    /// Log and broadcast. Having no subscriber is fine.
    pub fn publish(&self, event: ReconciliationNeeded) {
        error!(
            incident_id = %event.incident_id,
            effect = %event.target,
            attempts = event.attempts,
            last_error = %event.last_error,
            "Reconciliation needed"
        );
        let _ = self.tx.send(event);
    }
}

/// Incidents seen by [`watch_incidents`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IncidentSummary {
    pub received: u64,
    /// Events dropped because the watcher fell behind.
    pub missed: u64,
    /// Targets still needing reconciliation, in arrival order.
    pub targets: Vec<String>,
}

/// Collect incidents from `events` until `shutdown`, then log what is
/// left for the reconciler.
pub async fn watch_incidents(
    mut events: broadcast::Receiver<ReconciliationNeeded>,
    shutdown: CancellationToken,
) -> IncidentSummary {
    let mut summary = IncidentSummary::default();
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    summary.received += 1;
                    if !summary.targets.contains(&event.target) {
                        summary.targets.push(event.target);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Incident watcher fell behind");
                    summary.missed += missed;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    if summary.received > 0 || summary.missed > 0 {
        warn!(
            received = summary.received,
            missed = summary.missed,
            targets = ?summary.targets,
            "Targets left for reconciliation"
        );
    } else {
        info!("No reconciliation incidents");
    }
    summary
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
