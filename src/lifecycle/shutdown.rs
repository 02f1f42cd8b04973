//! Shutdown coordination.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::net::connection::ConnectionTracker;

/// Broadcasts the shutdown signal to every accept loop and background task.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every subscriber. Returns how many were listening.
    pub fn trigger(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    /// Signal shutdown, then wait up to `grace` for in-flight connections.
    /// Returns false if connections were still open at the deadline.
    pub async fn trigger_and_drain(&self, tracker: &ConnectionTracker, grace: Duration) -> bool {
        let listeners = self.trigger();
        tracing::info!(listeners, active = tracker.active_count(), "Shutdown triggered, draining connections");
        let drained = tracker.wait_for_drain(grace).await;
        if !drained {
            tracing::warn!(
                active = tracker.active_count(),
                grace_secs = grace.as_secs(),
                "Connections still open after grace period"
            );
        }
        drained
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
