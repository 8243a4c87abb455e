//! Ping-based health checking with consecutive-failure detection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use infermesh_core::types::{NodeId, NodeStatus};

use crate::config::HealthConfig;
use crate::transport::PeerTransport;
use crate::util::{ewma, now_ms};

use super::types::{HealthCheck, HealthStatus};
use super::view::ClusterView;

/// Consecutive ping failures after which a node is marked offline.
pub const OFFLINE_FAILURE_THRESHOLD: u32 = 3;

/// Checks every known peer with a transport-level ping each interval.
///
/// On success the node returns to `Online` and its failure counter resets;
/// after [`OFFLINE_FAILURE_THRESHOLD`] consecutive failures the node is
/// marked `Offline`. Per-node results are retained for operator
/// read-through.
pub struct HealthChecker {
    view: Arc<ClusterView>,
    transport: Arc<dyn PeerTransport>,
    checks: DashMap<NodeId, HealthCheck>,
    ping_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        view: Arc<ClusterView>,
        transport: Arc<dyn PeerTransport>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            view,
            transport,
            checks: DashMap::new(),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
        }
    }

    /// Pings every known peer once, concurrently, and applies the
    /// success/failure rules.
    pub async fn check_all(&self) {
        let peers: Vec<NodeId> = self
            .view
            .all()
            .into_iter()
            .map(|n| n.id)
            .filter(|id| id != self.view.local_id())
            .collect();

        futures_util::future::join_all(peers.iter().map(|peer| self.check_one(peer))).await;
    }

    async fn check_one(&self, peer: &str) {
        let now = now_ms();
        let result = tokio::time::timeout(self.ping_timeout, self.transport.ping(peer)).await;

        match result {
            Ok(Ok(rtt)) => {
                let latency_ms = rtt.as_secs_f64() * 1000.0;
                self.view.record_latency(peer, latency_ms);
                self.view.touch(peer, now);
                if self.view.set_status(peer, NodeStatus::Online) {
                    debug!(node_id = %peer, "node back online");
                }

                let smoothed = self
                    .checks
                    .get(peer)
                    .and_then(|c| c.latency_ms)
                    .map_or(latency_ms, |prev| ewma(Some(prev), latency_ms, 0.3));
                self.checks.insert(
                    peer.to_string(),
                    HealthCheck {
                        node_id: peer.to_string(),
                        last_check_ms: now,
                        status: HealthStatus::Healthy,
                        latency_ms: Some(smoothed),
                        last_error: None,
                        consecutive_failures: 0,
                    },
                );
                metrics::counter!("cluster_health_checks_ok").increment(1);
            }
            other => {
                let error = match other {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!("ping timed out after {:?}", self.ping_timeout),
                };
                let (failures, last_latency) = self
                    .checks
                    .get(peer)
                    .map_or((1, None), |c| (c.consecutive_failures + 1, c.latency_ms));

                let status = if failures >= OFFLINE_FAILURE_THRESHOLD {
                    if self.view.set_status(peer, NodeStatus::Offline) {
                        warn!(node_id = %peer, failures, "marking node offline");
                    }
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };

                self.checks.insert(
                    peer.to_string(),
                    HealthCheck {
                        node_id: peer.to_string(),
                        last_check_ms: now,
                        status,
                        latency_ms: last_latency,
                        last_error: Some(error),
                        consecutive_failures: failures,
                    },
                );
                metrics::counter!("cluster_health_checks_failed").increment(1);
            }
        }
    }

    /// Latest check result for one node.
    #[must_use]
    pub fn check_result(&self, node_id: &str) -> Option<HealthCheck> {
        self.checks.get(node_id).map(|entry| entry.value().clone())
    }

    /// All retained check results.
    #[must_use]
    pub fn all_results(&self) -> Vec<HealthCheck> {
        self.checks.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drops tracking state for a departed node.
    pub fn forget(&self, node_id: &str) {
        self.checks.remove(node_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
