//! Runtime placement constraints.

use serde::{Deserialize, Serialize};

use infermesh_core::types::NodeInfo;

/// Node attribute a constraint tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    MemoryPercent,
    GpuPercent,
    LatencyMs,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

/// One placement constraint. Constraints apply in priority order
/// (descending); a node failing any active constraint is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub op: ConstraintOp,
    pub value: f64,
    pub priority: u8,
}

impl Constraint {
    fn observe(&self, node: &NodeInfo) -> Option<f64> {
        match self.kind {
            ConstraintKind::MemoryPercent => Some(node.usage.memory_percent),
            ConstraintKind::GpuPercent => Some(node.usage.gpu_percent),
            ConstraintKind::LatencyMs => node.latency_ms,
        }
    }

    /// Whether the node satisfies this constraint. A node with no
    /// measurement for the tested attribute is admitted -- absence of
    /// evidence is not a violation.
    #[must_use]
    pub fn admits(&self, node: &NodeInfo) -> bool {
        let Some(observed) = self.observe(node) else {
            return true;
        };
        match self.op {
            ConstraintOp::Lt => observed < self.value,
            ConstraintOp::Le => observed <= self.value,
            ConstraintOp::Eq => (observed - self.value).abs() < f64::EPSILON,
            ConstraintOp::Ge => observed >= self.value,
            ConstraintOp::Gt => observed > self.value,
        }
    }
}

/// Applies all constraints in priority order, returning admitted nodes.
#[must_use]
pub fn filter_nodes(nodes: &[NodeInfo], constraints: &[Constraint]) -> Vec<NodeInfo> {
    let mut ordered: Vec<&Constraint> = constraints.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    nodes
        .iter()
        .filter(|node| ordered.iter().all(|c| c.admits(node)))
        .cloned()
        .collect()
}
