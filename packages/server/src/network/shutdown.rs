//! Graceful shutdown controller.
//!
//! Tracks the server's externally visible health state
//! (starting/ready/draining/stopped), fans out a cancellation signal to
//! background loops, and counts in-flight handlers so shutdown can drain
//! them before exit.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthState::Ready,
            2 => HealthState::Draining,
            3 => HealthState::Stopped,
            _ => HealthState::Starting,
        }
    }
}

/// Shared controller for readiness and shutdown.
pub struct ShutdownController {
    state: AtomicU8,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Marks startup complete; readiness probes flip to 200.
    pub fn set_ready(&self) {
        self.state.store(1, Ordering::SeqCst);
    }

    /// Starts draining: readiness flips to 503 and the cancellation token
    /// fires for every background loop.
    pub fn trigger_shutdown(&self) {
        self.state.store(2, Ordering::SeqCst);
        self.cancel.cancel();
        info!("shutdown triggered, draining");
    }

    pub fn set_stopped(&self) {
        self.state.store(3, Ordering::SeqCst);
    }

    /// Token cloned into every background loop; fires on shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves when shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// RAII guard counting one in-flight request.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    /// Waits until in-flight handlers drain or the budget elapses.
    pub async fn wait_for_drain(&self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        while self.in_flight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
