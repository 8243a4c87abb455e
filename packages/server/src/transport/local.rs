//! In-process transport hub and inference runtime stub.
//!
//! `LocalTransportHub` wires any number of in-process nodes into a loopback
//! mesh with per-peer FIFO delivery, injectable send failures, suspendable
//! ping responses, and configurable simulated latency. It backs the test
//! suite and single-node deployments; a real P2P stack implements the same
//! [`PeerTransport`] contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use infermesh_core::messages::{
    AnnouncePayload, CancelSubtaskPayload, DispatchSubtaskPayload, Envelope, HeartbeatPayload,
    PeerMessage, ReplicatePayload,
};
use infermesh_core::types::{NodeId, Subtask, SubtaskOutcome};

use crate::error::ServerError;
use crate::util::now_ms;

use super::traits::{InferenceRuntime, PeerHandler, PeerTransport};

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Per-node registration inside the hub.
struct HubNode {
    address: String,
    handler: Arc<dyn PeerHandler>,
    /// When set, pings to this node fail (simulates an unresponsive peer).
    pings_suspended: AtomicBool,
    /// When set, all sends to this node fail with a transport error.
    unreachable: AtomicBool,
    /// Simulated one-way latency added to pings.
    latency: Mutex<Duration>,
}

/// In-memory loopback mesh connecting in-process nodes.
pub struct LocalTransportHub {
    nodes: DashMap<NodeId, Arc<HubNode>>,
}

impl Default for LocalTransportHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransportHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Attaches a node to the mesh and returns its transport handle.
    pub fn attach(
        self: &Arc<Self>,
        node_id: &str,
        address: &str,
        handler: Arc<dyn PeerHandler>,
    ) -> LocalTransport {
        self.nodes.insert(
            node_id.to_string(),
            Arc::new(HubNode {
                address: address.to_string(),
                handler,
                pings_suspended: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
                latency: Mutex::new(Duration::from_micros(100)),
            }),
        );
        LocalTransport {
            hub: Arc::clone(self),
            local_id: node_id.to_string(),
            local_address: address.to_string(),
            clock: AtomicU64::new(0),
        }
    }

    /// Detaches a node; subsequent sends to it fail.
    pub fn detach(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Suspends or resumes ping responses from a node (the node stays
    /// reachable for other traffic). Drives failure-detection tests.
    pub fn suspend_pings(&self, node_id: &str, suspended: bool) {
        if let Some(node) = self.nodes.get(node_id) {
            node.pings_suspended.store(suspended, Ordering::SeqCst);
        }
    }

    /// Makes every send toward a node fail with a transport error.
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        if let Some(node) = self.nodes.get(node_id) {
            node.unreachable.store(unreachable, Ordering::SeqCst);
        }
    }

    /// Sets the simulated ping latency for a node.
    pub fn set_latency(&self, node_id: &str, latency: Duration) {
        if let Some(node) = self.nodes.get(node_id) {
            *node.latency.lock() = latency;
        }
    }

    fn node(&self, node_id: &str) -> Result<Arc<HubNode>, ServerError> {
        let node = self
            .nodes
            .get(node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ServerError::Transport(format!("peer {node_id} not connected")))?;
        if node.unreachable.load(Ordering::SeqCst) {
            return Err(ServerError::Transport(format!("peer {node_id} unreachable")));
        }
        Ok(node)
    }

    async fn deliver(&self, target: &str, envelope: Envelope) -> Result<(), ServerError> {
        let node = self.node(target)?;
        // Round-trip through MessagePack so the loopback mesh exercises
        // the same wire path a remote transport would.
        let bytes = envelope
            .encode()
            .map_err(|e| ServerError::Transport(e.to_string()))?;
        let decoded =
            Envelope::decode(&bytes).map_err(|e| ServerError::Transport(e.to_string()))?;
        node.handler.handle_envelope(decoded).await;
        Ok(())
    }

    fn peer_ids_excluding(&self, local: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| id != local)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Transport handle
// ---------------------------------------------------------------------------

/// One node's handle onto the hub.
pub struct LocalTransport {
    hub: Arc<LocalTransportHub>,
    local_id: NodeId,
    local_address: String,
    /// Last issued envelope timestamp; envelopes must be strictly
    /// monotonic per sender for receiver-side deduplication.
    clock: AtomicU64,
}

impl LocalTransport {
    fn next_timestamp(&self) -> u64 {
        let now = now_ms();
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.saturating_add(1).max(now))
            })
            .unwrap_or(0);
        prev.saturating_add(1).max(now)
    }

    fn envelope(&self, message: PeerMessage) -> Envelope {
        Envelope::new(self.local_id.clone(), self.next_timestamp(), message)
    }

    /// Broadcast helper: best-effort delivery to every peer, first error
    /// reported after attempting all.
    async fn broadcast_message(&self, message: PeerMessage) -> Result<(), ServerError> {
        let mut first_err = None;
        for peer in self.hub.peer_ids_excluding(&self.local_id) {
            let env = self.envelope(message.clone());
            if let Err(e) = self.hub.deliver(&peer, env).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    fn local_node_id(&self) -> NodeId {
        self.local_id.clone()
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.hub.peer_ids_excluding(&self.local_id)
    }

    async fn announce(&self, payload: AnnouncePayload) -> Result<(), ServerError> {
        self.broadcast_message(PeerMessage::Announce(payload)).await
    }

    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<(), ServerError> {
        self.broadcast_message(PeerMessage::Heartbeat(payload)).await
    }

    async fn ping(&self, peer: &str) -> Result<Duration, ServerError> {
        let node = self.hub.node(peer)?;
        if node.pings_suspended.load(Ordering::SeqCst) {
            return Err(ServerError::Timeout(format!("ping to {peer} timed out")));
        }
        let latency = *node.latency.lock();
        let start = Instant::now();
        tokio::time::sleep(latency).await;
        Ok(start.elapsed())
    }

    async fn broadcast(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), ServerError> {
        self.broadcast_message(PeerMessage::Broadcast(
            infermesh_core::messages::BroadcastPayload {
                topic: topic.to_string(),
                payload,
            },
        ))
        .await
    }

    async fn replicate(&self, peer: &str, payload: ReplicatePayload) -> Result<(), ServerError> {
        let node = self.hub.node(peer)?;
        node.handler.handle_replicate(payload).await
    }

    async fn dispatch_subtask(
        &self,
        peer: &str,
        subtask: Subtask,
    ) -> Result<SubtaskOutcome, ServerError> {
        let node = self.hub.node(peer)?;
        Ok(node.handler.handle_dispatch(subtask).await)
    }

    async fn cancel_subtask(&self, peer: &str, subtask_id: Uuid) -> Result<(), ServerError> {
        let env = self.envelope(PeerMessage::CancelSubtask(CancelSubtaskPayload {
            subtask_id,
        }));
        self.hub.deliver(peer, env).await
    }
}

// ---------------------------------------------------------------------------
// EchoRuntime
// ---------------------------------------------------------------------------

/// Capability-stub inference runtime: echoes the payload back tagged with
/// the executing node. Stands in for the GPU runtime in tests and
/// single-node bring-up.
pub struct EchoRuntime {
    node_id: NodeId,
}

impl EchoRuntime {
    #[must_use]
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
        }
    }
}

#[async_trait]
impl InferenceRuntime for EchoRuntime {
    async fn execute(&self, subtask: &Subtask) -> Result<serde_json::Value, ServerError> {
        Ok(serde_json::json!({
            "node": self.node_id,
            "model": subtask.model,
            "echo": subtask.payload,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
