//! Membership and health wire payloads.

use serde::{Deserialize, Serialize};

use crate::types::{NodeCapacity, NodeId, NodeInfo, NodeUsage};

/// Discriminator for node announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceAction {
    Join,
    Leave,
    Update,
}

/// A node announcing a membership change for itself.
///
/// Receivers insert unknown nodes on `join`, overwrite
/// capacity/usage/models on `update`, and delete on `leave`. The embedded
/// `status` field is advisory only; the receiver's health checker decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub action: AnnounceAction,
    pub node: NodeInfo,
}

/// Periodic capacity and usage broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: NodeId,
    /// Sender-side timestamp; heartbeats older than the receiver's stored
    /// `last_seen` for this node are dropped (last-writer-wins).
    pub timestamp_ms: u64,
    pub capacity: NodeCapacity,
    pub usage: NodeUsage,
    pub models: Vec<String>,
}

/// Transport-level liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub nonce: u64,
}

/// Response to a [`PingPayload`], echoing its nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub nonce: u64,
    pub timestamp_ms: u64,
}
