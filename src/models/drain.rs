//! In-flight call tracking for drain coordination.
//!
//! Every inference call holds a [`FlightGuard`] against the instance serving
//! it. An instance is released only once its tracker reports zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum DrainError {
    #[error("Drain timed out with {0} calls still in flight")]
    Timeout(usize),
}

/// Counts in-flight calls against one model instance.
#[derive(Debug, Default)]
pub struct FlightTracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call until the returned guard drops.
    pub fn track(self: &Arc<Self>) -> FlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        FlightGuard { tracker: Arc::clone(self) }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no calls are in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// [`Self::drained`] bounded by `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        tokio::time::timeout(timeout, self.drained())
            .await
            .map_err(|_| DrainError::Timeout(self.in_flight()))
    }
}

/// RAII guard that decrements the in-flight count on drop.
#[derive(Debug)]
pub struct FlightGuard {
    tracker: Arc<FlightTracker>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
