//! Whole-task placement for work that does not decompose.

use infermesh_core::types::{
    DistributedTask, NodeInfo, Partition, PartitionData, PartitionPlan,
};

use crate::error::ServerError;

use super::strategy::{estimate_latency_ms, estimate_plan, PartitionContext, PartitionStrategy};

/// Runs the entire task as one unit on the least-loaded node.
///
/// The catch-all strategy: it accepts anything a node exists for, scores
/// low on context preservation, and therefore only wins when no
/// decomposing strategy applies (small clusters, opaque payloads).
pub struct TaskParallelStrategy;

impl PartitionStrategy for TaskParallelStrategy {
    fn name(&self) -> &'static str {
        "task_parallel"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn context_preservation(&self) -> f64 {
        0.4
    }

    fn can_handle(&self, _task: &DistributedTask, ctx: &PartitionContext<'_>) -> bool {
        !ctx.nodes.is_empty()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn partition(
        &self,
        task: &DistributedTask,
        ctx: &PartitionContext<'_>,
    ) -> Result<PartitionPlan, ServerError> {
        let total = (task.input.batch_len() as u32).min(ctx.config.max_batch_size);
        if total == 0 {
            return Ok(PartitionPlan::empty(self.name()));
        }

        let node = ctx
            .nodes
            .iter()
            .min_by(|a, b| {
                a.usage
                    .effective_load()
                    .partial_cmp(&b.usage.effective_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or_else(|| {
                ServerError::PartitionFailure("no nodes available".to_string())
            })?;

        let latency = estimate_latency_ms(
            node.capacity.compute_score,
            total,
            node.usage.effective_load(),
        );
        let partitions = vec![Partition {
            index: 0,
            node_hint: Some(node.id.clone()),
            data: PartitionData::Batch {
                offset: 0,
                size: total,
            },
            estimated_latency_ms: latency,
            estimated_memory_bytes: u64::from(total) * 256 * 1024,
        }];
        let (latency, throughput) = estimate_plan(&[(latency, total)]);

        Ok(PartitionPlan {
            strategy: self.name().to_string(),
            partitions,
            dependencies: Vec::new(),
            estimated_latency_ms: latency,
            estimated_throughput: throughput,
            efficiency: 1.0,
        })
    }
}
