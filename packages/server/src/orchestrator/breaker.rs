//! Per-node circuit breakers.
//!
//! A breaker opens after a configurable failure density within a rolling
//! window; while open, the load balancer filters the node out of
//! candidate sets. After `open_ms` the breaker half-opens and admits one
//! probe; the next success closes it, the next failure re-opens it.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use infermesh_core::types::NodeId;

use crate::config::OrchestratorConfig;

/// Breaker state, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    /// Failure timestamps within the rolling window.
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: Vec::new(),
            opened_at: None,
        }
    }
}

/// Snapshot of one node's breaker for the metrics surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub node_id: NodeId,
    pub state: BreakerState,
    pub recent_failures: usize,
}

/// Registry of per-node breakers.
pub struct BreakerRegistry {
    breakers: DashMap<NodeId, Mutex<Breaker>>,
    failure_threshold: u32,
    window: Duration,
    open_duration: Duration,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.circuit_failure_threshold,
            window: Duration::from_millis(config.circuit_window_ms),
            open_duration: Duration::from_millis(config.circuit_open_ms),
        }
    }

    fn with_breaker<R>(&self, node_id: &str, f: impl FnOnce(&mut Breaker) -> R) -> R {
        let entry = self
            .breakers
            .entry(node_id.to_string())
            .or_insert_with(|| Mutex::new(Breaker::new()));
        let mut breaker = entry.lock();
        f(&mut breaker)
    }

    /// Records a dispatch failure toward a node, possibly opening its
    /// breaker.
    pub fn record_failure(&self, node_id: &str) {
        let window = self.window;
        let threshold = self.failure_threshold as usize;
        let opened = self.with_breaker(node_id, |b| {
            let now = Instant::now();
            match b.state {
                BreakerState::HalfOpen => {
                    // The probe failed; straight back to open.
                    b.state = BreakerState::Open;
                    b.opened_at = Some(now);
                    true
                }
                BreakerState::Open => false,
                BreakerState::Closed => {
                    b.failures.retain(|t| now.duration_since(*t) <= window);
                    b.failures.push(now);
                    if b.failures.len() >= threshold {
                        b.state = BreakerState::Open;
                        b.opened_at = Some(now);
                        b.failures.clear();
                        true
                    } else {
                        false
                    }
                }
            }
        });
        if opened {
            tracing::warn!(node_id, "circuit breaker opened");
            metrics::counter!("breaker_opened").increment(1);
        }
    }

    /// Records a successful dispatch, closing a half-open breaker.
    pub fn record_success(&self, node_id: &str) {
        self.with_breaker(node_id, |b| {
            if b.state == BreakerState::HalfOpen {
                b.state = BreakerState::Closed;
                b.opened_at = None;
            }
            b.failures.clear();
        });
    }

    /// Whether the node should be filtered from scheduling. An open
    /// breaker past its timer transitions to half-open and admits a probe.
    pub fn is_open(&self, node_id: &str) -> bool {
        let open_duration = self.open_duration;
        self.with_breaker(node_id, |b| match b.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = b
                    .opened_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= open_duration {
                    b.state = BreakerState::HalfOpen;
                    false
                } else {
                    true
                }
            }
        })
    }

    /// Current state without side effects (no half-open transition).
    #[must_use]
    pub fn state(&self, node_id: &str) -> BreakerState {
        self.breakers
            .get(node_id)
            .map_or(BreakerState::Closed, |entry| entry.lock().state)
    }

    /// Snapshot of all tracked breakers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snaps: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let b = entry.value().lock();
                BreakerSnapshot {
                    node_id: entry.key().clone(),
                    state: b.state,
                    recent_failures: b.failures.len(),
                }
            })
            .collect();
        snaps.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        snaps
    }

    /// Drops tracking for a departed node.
    pub fn forget(&self, node_id: &str) {
        self.breakers.remove(node_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, open_ms: u64) -> BreakerRegistry {
        BreakerRegistry::new(&OrchestratorConfig {
            circuit_failure_threshold: threshold,
            circuit_open_ms: open_ms,
            ..OrchestratorConfig::default()
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breakers = registry(3, 60_000);
        assert!(!breakers.is_open("a"));

        breakers.record_failure("a");
        breakers.record_failure("a");
        assert!(!breakers.is_open("a"));

        breakers.record_failure("a");
        assert!(breakers.is_open("a"));
        assert_eq!(breakers.state("a"), BreakerState::Open);
    }

    #[test]
    fn success_resets_accumulated_failures() {
        let breakers = registry(3, 60_000);
        breakers.record_failure("a");
        breakers.record_failure("a");
        breakers.record_success("a");
        breakers.record_failure("a");
        breakers.record_failure("a");
        assert!(!breakers.is_open("a"), "window restarted after success");
    }

    #[test]
    fn half_opens_after_timer_and_closes_on_success() {
        let breakers = registry(1, 0); // opens on first failure, timer elapses immediately
        breakers.record_failure("a");

        // Timer already elapsed: probe admitted, state is half-open.
        assert!(!breakers.is_open("a"));
        assert_eq!(breakers.state("a"), BreakerState::HalfOpen);

        breakers.record_success("a");
        assert_eq!(breakers.state("a"), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breakers = registry(1, 0);
        breakers.record_failure("a");
        assert!(!breakers.is_open("a")); // transitions to half-open

        breakers.record_failure("a");
        assert_eq!(breakers.state("a"), BreakerState::Open);
    }

    #[test]
    fn nodes_are_tracked_independently() {
        let breakers = registry(1, 60_000);
        breakers.record_failure("a");
        assert!(breakers.is_open("a"));
        assert!(!breakers.is_open("b"));

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].node_id, "a");
        assert_eq!(snapshot[0].state, BreakerState::Open);
    }
}
