//! Cluster-internal domain types.
//!
//! These are node-local bookkeeping structures; the wire-facing node record
//! lives in `infermesh_core::types::NodeInfo`.

use serde::{Deserialize, Serialize};

use infermesh_core::types::{NodeId, NodeStatus};

/// Health classification produced by the local health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-node health check record, owned by the cluster manager and kept for
/// read-through by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub node_id: NodeId,
    pub last_check_ms: u64,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Events emitted when the cluster view changes.
///
/// Subscribers (scheduler, fault tolerance) receive these via an unbounded
/// mpsc channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    NodeJoined(NodeId),
    NodeUpdated(NodeId),
    NodeLeft(NodeId),
    StatusChanged { node_id: NodeId, status: NodeStatus },
}
