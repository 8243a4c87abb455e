//! Cluster manager: local registration, announcements, heartbeats, and
//! periodic peer discovery.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use infermesh_core::messages::{AnnounceAction, AnnouncePayload, HeartbeatPayload};
use infermesh_core::types::{NodeCapacity, NodeInfo, NodeStatus, NodeUsage};

use crate::config::{HealthConfig, NodeConfig};
use crate::error::ServerError;
use crate::transport::PeerTransport;
use crate::util::now_ms;

use super::view::ClusterView;

// ---------------------------------------------------------------------------
// CapacityProbe
// ---------------------------------------------------------------------------

/// Local capacity and usage introspection seam.
///
/// A probe failure never fails a heartbeat; the manager reuses the last
/// known values.
pub trait CapacityProbe: Send + Sync + 'static {
    /// Static capacity of this machine.
    ///
    /// # Errors
    ///
    /// May fail when the underlying introspection source is unavailable.
    fn capacity(&self) -> Result<NodeCapacity, ServerError>;

    /// Live utilization of this machine.
    ///
    /// # Errors
    ///
    /// May fail when the underlying introspection source is unavailable.
    fn usage(&self) -> Result<NodeUsage, ServerError>;
}

/// Fixed-capacity probe with settable usage, for tests and deployments
/// where capacity is declared rather than measured.
pub struct StaticProbe {
    capacity: NodeCapacity,
    usage: Mutex<NodeUsage>,
}

impl StaticProbe {
    #[must_use]
    pub fn new(capacity: NodeCapacity) -> Self {
        Self {
            capacity,
            usage: Mutex::new(NodeUsage::default()),
        }
    }

    pub fn set_usage(&self, usage: NodeUsage) {
        *self.usage.lock() = usage;
    }
}

impl CapacityProbe for StaticProbe {
    fn capacity(&self) -> Result<NodeCapacity, ServerError> {
        Ok(self.capacity.clone())
    }

    fn usage(&self) -> Result<NodeUsage, ServerError> {
        Ok(self.usage.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// ClusterManager
// ---------------------------------------------------------------------------

/// Drives membership for the local node: join/leave announcements,
/// heartbeat broadcast, inbound announcement handling, and the periodic
/// discovery reconciliation against the transport's peer set.
pub struct ClusterManager {
    view: Arc<ClusterView>,
    transport: Arc<dyn PeerTransport>,
    node_config: NodeConfig,
    health_config: HealthConfig,
    probe: Arc<dyn CapacityProbe>,
    /// Last successfully polled values, reused when the probe fails.
    last_capacity: Mutex<NodeCapacity>,
    last_usage: Mutex<NodeUsage>,
    /// Models held locally, maintained by the model registry.
    local_models: RwLock<Vec<String>>,
}

impl ClusterManager {
    pub fn new(
        view: Arc<ClusterView>,
        transport: Arc<dyn PeerTransport>,
        node_config: NodeConfig,
        health_config: HealthConfig,
        probe: Arc<dyn CapacityProbe>,
    ) -> Self {
        let initial_capacity = probe.capacity().unwrap_or_default();
        Self {
            view,
            transport,
            node_config,
            health_config,
            probe,
            last_capacity: Mutex::new(initial_capacity),
            last_usage: Mutex::new(NodeUsage::default()),
            local_models: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.view)
    }

    /// Replaces the locally held model list broadcast in heartbeats.
    pub fn set_local_models(&self, models: Vec<String>) {
        *self.local_models.write() = models;
    }

    fn poll_probe(&self) -> (NodeCapacity, NodeUsage) {
        match self.probe.capacity() {
            Ok(capacity) => *self.last_capacity.lock() = capacity,
            Err(e) => debug!("capacity probe failed, reusing last values: {e}"),
        }
        match self.probe.usage() {
            Ok(usage) => *self.last_usage.lock() = usage,
            Err(e) => debug!("usage probe failed, reusing last values: {e}"),
        }
        (self.last_capacity.lock().clone(), self.last_usage.lock().clone())
    }

    fn local_info(&self, now: u64) -> NodeInfo {
        let (capacity, usage) = self.poll_probe();
        NodeInfo {
            id: self.view.local_id().to_string(),
            address: self.node_config.address.clone(),
            status: NodeStatus::Online,
            capacity,
            usage,
            models: self.local_models.read().clone(),
            capabilities: self.node_config.capabilities.clone(),
            last_seen_ms: now,
            latency_ms: None,
            bandwidth_mbps: None,
        }
    }

    /// Registers the local node: inserts it into the view and broadcasts a
    /// `join` announcement with the full record.
    ///
    /// # Errors
    ///
    /// Propagates a transport failure; the record is inserted locally
    /// either way.
    pub async fn register_local(&self) -> Result<(), ServerError> {
        let info = self.local_info(now_ms());
        self.view.upsert(info.clone());
        info!(node_id = %info.id, address = %info.address, "registering local node");
        self.transport
            .announce(AnnouncePayload {
                action: AnnounceAction::Join,
                node: info,
            })
            .await
    }

    /// Broadcasts this node's capacity and usage. Probe failures fall back
    /// to the last known values; broadcast failures are logged and retried
    /// by the next tick.
    pub async fn send_heartbeat(&self) {
        let now = now_ms();
        let (capacity, usage) = self.poll_probe();
        let payload = HeartbeatPayload {
            node_id: self.view.local_id().to_string(),
            timestamp_ms: now,
            capacity,
            usage,
            models: self.local_models.read().clone(),
        };

        // Keep our own record fresh so invariant checks treat the local
        // node like any peer.
        self.view.apply_heartbeat(&payload, &self.node_config.address);

        if let Err(e) = self.transport.heartbeat(payload).await {
            warn!("heartbeat broadcast failed, retrying next tick: {e}");
            metrics::counter!("cluster_heartbeat_send_failures").increment(1);
        } else {
            metrics::counter!("cluster_heartbeats_sent").increment(1);
        }
    }

    /// Applies an inbound announcement.
    ///
    /// The sender's `status` field is never trusted; only the local health
    /// checker moves remote nodes out of `Online`.
    pub fn handle_announcement(&self, payload: AnnouncePayload) {
        match payload.action {
            AnnounceAction::Join => {
                if self.view.contains(&payload.node.id) {
                    // Re-join of a known node refreshes owner fields only.
                    self.view.apply_update(&payload.node);
                } else {
                    let mut node = payload.node;
                    node.status = NodeStatus::Online;
                    info!(node_id = %node.id, "peer joined");
                    self.view.upsert(node);
                }
            }
            AnnounceAction::Update => self.view.apply_update(&payload.node),
            AnnounceAction::Leave => {
                info!(node_id = %payload.node.id, "peer left");
                self.view.remove(&payload.node.id);
            }
        }
    }

    /// Applies an inbound heartbeat (last-writer-wins by timestamp).
    pub fn handle_heartbeat(&self, payload: &HeartbeatPayload) {
        let applied = self.view.apply_heartbeat(payload, "");
        if applied {
            metrics::counter!("cluster_heartbeats_applied").increment(1);
        } else {
            metrics::counter!("cluster_heartbeats_stale").increment(1);
        }
    }

    /// Reconciles the view against the transport's peer set, synthesizing a
    /// stub record for any connected peer we have not yet seen. The next
    /// heartbeat fills in its capacity.
    pub fn discovery_tick(&self) {
        let now = now_ms();
        for peer in self.transport.peer_ids() {
            if !self.view.contains(&peer) {
                debug!(node_id = %peer, "discovered peer without announcement, inserting stub");
                self.view
                    .upsert(NodeInfo::stub(peer.clone(), String::new(), now));
            }
        }
    }

    /// Broadcasts a `leave` announcement within the configured budget; an
    /// unresponsive mesh is abandoned rather than delaying shutdown.
    pub async fn leave(&self) {
        let info = self.local_info(now_ms());
        let budget = Duration::from_millis(self.health_config.leave_budget_ms);
        let send = self.transport.announce(AnnouncePayload {
            action: AnnounceAction::Leave,
            node: info,
        });
        match tokio::time::timeout(budget, send).await {
            Ok(Ok(())) => info!("leave announcement sent"),
            Ok(Err(e)) => warn!("leave announcement failed: {e}"),
            Err(_) => warn!("leave announcement abandoned after {budget:?}"),
        }
    }

    /// Operator-facing status override (e.g. draining for maintenance).
    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<(), ServerError> {
        if self.view.set_status(node_id, status) || self.view.contains(node_id) {
            Ok(())
        } else {
            Err(ServerError::NotFound(format!("node {node_id}")))
        }
    }

    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<NodeInfo> {
        self.view.get(node_id)
    }

    #[must_use]
    pub fn get_available_nodes(&self) -> Vec<NodeInfo> {
        self.view.available()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
