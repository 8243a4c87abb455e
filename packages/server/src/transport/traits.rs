//! Peer transport and replicated key-value log contracts.
//!
//! The core depends on these collaborators only through the minimal
//! contracts below; production deployments plug in a real P2P stack and
//! consensus log, while tests use the in-process implementations in
//! [`super::local`] and [`super::kv`].

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use infermesh_core::messages::{
    AnnouncePayload, Envelope, HeartbeatPayload, ReplicatePayload,
};
use infermesh_core::types::{NodeId, Subtask, SubtaskOutcome};

use crate::error::ServerError;

// ---------------------------------------------------------------------------
// PeerTransport
// ---------------------------------------------------------------------------

/// Outbound peer RPC surface.
///
/// Broadcast sends (`announce`, `heartbeat`, `broadcast`) are best-effort
/// per peer; a send failure is logged by the caller and retried on the
/// next tick. Targeted RPCs (`ping`, `replicate`, `dispatch_subtask`,
/// `cancel_subtask`) surface [`ServerError::Transport`] to the caller.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// This node's transport-level identifier.
    fn local_node_id(&self) -> NodeId;

    /// Address peers use to reach this node.
    fn local_address(&self) -> String;

    /// Currently connected peer ids, as known by the transport layer.
    /// Used by the periodic discovery reconciliation.
    fn peer_ids(&self) -> Vec<NodeId>;

    /// Broadcasts a membership announcement to all connected peers.
    async fn announce(&self, payload: AnnouncePayload) -> Result<(), ServerError>;

    /// Broadcasts a capacity/usage heartbeat to all connected peers.
    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<(), ServerError>;

    /// Round-trip liveness probe returning measured latency.
    async fn ping(&self, peer: &str) -> Result<Duration, ServerError>;

    /// Fire-and-forget topic broadcast to all connected peers.
    async fn broadcast(&self, topic: &str, payload: serde_json::Value)
        -> Result<(), ServerError>;

    /// Streams a model blob to one peer; resolves after the peer verified
    /// the checksum and stored the blob.
    async fn replicate(&self, peer: &str, payload: ReplicatePayload) -> Result<(), ServerError>;

    /// Dispatches one subtask to a peer and awaits its outcome.
    async fn dispatch_subtask(
        &self,
        peer: &str,
        subtask: Subtask,
    ) -> Result<SubtaskOutcome, ServerError>;

    /// Cancels an in-flight subtask on a peer.
    async fn cancel_subtask(&self, peer: &str, subtask_id: Uuid) -> Result<(), ServerError>;
}

// ---------------------------------------------------------------------------
// PeerHandler
// ---------------------------------------------------------------------------

/// Inbound RPC surface a node registers with its transport.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// Handles a fire-and-forget envelope (announce, heartbeat, broadcast,
    /// subtask result, cancel).
    async fn handle_envelope(&self, envelope: Envelope);

    /// Executes one subtask locally and returns its outcome.
    async fn handle_dispatch(&self, subtask: Subtask) -> SubtaskOutcome;

    /// Receives a replicated model blob. Implementations verify the
    /// checksum before storing and registering.
    async fn handle_replicate(&self, payload: ReplicatePayload) -> Result<(), ServerError>;
}

// ---------------------------------------------------------------------------
// KvLog
// ---------------------------------------------------------------------------

/// A key-value entry applied from the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    /// `None` marks a deletion.
    pub value: Option<Vec<u8>>,
}

/// Replicated key-value store contract.
///
/// The core uses it only as a store for cluster-wide registrations (model
/// replica lists, membership snapshots); consensus semantics live behind
/// this trait.
#[async_trait]
pub trait KvLog: Send + Sync + 'static {
    /// Writes a key. Visible to `get` once the log applies it.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ServerError>;

    /// Deletes a key.
    async fn delete(&self, key: &str) -> Result<(), ServerError>;

    /// Reads a key's current value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServerError>;

    /// Reads all keys with the given prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ServerError>;

    /// Subscribes to applied entries. Late subscribers miss earlier
    /// entries; read-through with `scan_prefix` first.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<KvEntry>;
}

// ---------------------------------------------------------------------------
// InferenceRuntime
// ---------------------------------------------------------------------------

/// Local GPU inference runtime contract.
///
/// The real runtime is an external collaborator; the default
/// [`super::local::EchoRuntime`] is a capability stub used by tests and
/// single-node bring-up.
#[async_trait]
pub trait InferenceRuntime: Send + Sync + 'static {
    /// Executes one subtask's payload against a locally held model.
    async fn execute(&self, subtask: &Subtask) -> Result<serde_json::Value, ServerError>;
}
