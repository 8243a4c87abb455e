//! Partition strategy contract and latency estimation.

use infermesh_core::types::{DistributedTask, NodeInfo, PartitionPlan};

use crate::config::PartitionConfig;
use crate::error::ServerError;

/// Inputs a strategy sees beyond the task itself.
pub struct PartitionContext<'a> {
    /// Candidate nodes (already filtered to schedulable status).
    pub nodes: &'a [NodeInfo],
    /// Registered size of the target model, when known.
    pub model_size_bytes: Option<u64>,
    pub config: &'a PartitionConfig,
}

/// A registered partitioning strategy.
///
/// Strategies are pure planners: they never dispatch work and never hold
/// locks across calls. Outcome metrics are tracked by the engine.
pub trait PartitionStrategy: Send + Sync + 'static {
    /// Stable strategy name, used for selection ties and plan attribution.
    fn name(&self) -> &'static str;

    /// Static priority for score ties; higher wins.
    fn priority(&self) -> u8;

    /// How well this strategy preserves cross-partition context, in `[0, 1]`.
    fn context_preservation(&self) -> f64;

    /// Whether this strategy can partition the given task.
    fn can_handle(&self, task: &DistributedTask, ctx: &PartitionContext<'_>) -> bool;

    /// Produces the plan.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PartitionFailure`] when the task cannot be
    /// planned despite `can_handle` (e.g. allocation bounds cannot fit).
    fn partition(
        &self,
        task: &DistributedTask,
        ctx: &PartitionContext<'_>,
    ) -> Result<PartitionPlan, ServerError>;
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Per-partition merge overhead added to the plan latency.
pub const MERGE_OVERHEAD_MS: f64 = 10.0;

/// Throughput efficiency factor applied to the plan estimate.
pub const THROUGHPUT_EFFICIENCY: f64 = 0.9;

/// Estimated latency for `items` units of work on a node:
/// `(100ms / compute_score) * items * (1 + utilization)`.
#[must_use]
pub fn estimate_latency_ms(compute_score: f64, items: u32, utilization: f64) -> f64 {
    let base = 100.0 / compute_score.max(0.01);
    base * f64::from(items) * (1.0 + utilization)
}

/// Plan-level latency and throughput from per-partition `(latency_ms, items)`
/// pairs: latency is the slowest partition plus merge overhead per
/// partition; throughput sums per-partition rates scaled by the efficiency
/// factor.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn estimate_plan(partitions: &[(f64, u32)]) -> (f64, f64) {
    if partitions.is_empty() {
        return (0.0, 0.0);
    }
    let slowest = partitions.iter().map(|(lat, _)| *lat).fold(0.0, f64::max);
    let latency = slowest + MERGE_OVERHEAD_MS * partitions.len() as f64;
    let throughput = partitions
        .iter()
        .filter(|(lat, _)| *lat > 0.0)
        .map(|(lat, items)| f64::from(*items) / (lat / 1000.0))
        .sum::<f64>()
        * THROUGHPUT_EFFICIENCY;
    (latency, throughput)
}
