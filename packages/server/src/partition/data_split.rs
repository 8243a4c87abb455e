//! Capacity-weighted data-split strategy for batchable workloads.

use infermesh_core::split::allocate_batch;
use infermesh_core::types::{
    DistributedTask, NodeInfo, Partition, PartitionData, PartitionPlan,
};

use crate::error::ServerError;

use super::strategy::{estimate_latency_ms, estimate_plan, PartitionContext, PartitionStrategy};

/// Rough per-item working set used for the memory estimate.
const ITEM_MEMORY_BYTES: u64 = 256 * 1024;

/// Splits a batchable task across nodes proportionally to capacity.
///
/// Eligibility per node: memory below 80%, GPU below 90%, and at most 5
/// active requests. The task itself must be batchable and at least two
/// eligible nodes must exist.
pub struct DataSplitStrategy;

fn node_eligible(node: &NodeInfo) -> bool {
    node.usage.memory_percent < 0.8
        && node.usage.gpu_percent < 0.9
        && node.usage.active_requests <= 5
}

fn eligible_nodes(ctx: &PartitionContext<'_>) -> Vec<NodeInfo> {
    let mut nodes: Vec<NodeInfo> = ctx
        .nodes
        .iter()
        .filter(|n| node_eligible(n))
        .cloned()
        .collect();
    // Sorted by id so allocation order (and leftover placement) is stable.
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
}

impl PartitionStrategy for DataSplitStrategy {
    fn name(&self) -> &'static str {
        "data_split"
    }

    fn priority(&self) -> u8 {
        5
    }

    fn context_preservation(&self) -> f64 {
        0.5
    }

    fn can_handle(&self, task: &DistributedTask, ctx: &PartitionContext<'_>) -> bool {
        task.is_batchable() && eligible_nodes(ctx).len() >= 2
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

        let nodes = eligible_nodes(ctx);
        let scores: Vec<f64> = nodes.iter().map(|n| n.capacity.compute_score).collect();

        let allocation = allocate_batch(
            total,
            &scores,
            ctx.config.min_partition_size,
            ctx.config.max_partition_size,
        )
        .map_err(|e| ServerError::PartitionFailure(e.to_string()))?;

        let mut partitions = Vec::new();
        let mut estimates = Vec::new();
        let mut offset = 0u32;
        let mut index = 0u32;
        for (node, &size) in nodes.iter().zip(allocation.sizes.iter()) {
            if size == 0 {
                continue;
            }
            let latency = estimate_latency_ms(
                node.capacity.compute_score,
                size,
                node.usage.effective_load(),
            );
            partitions.push(Partition {
                index,
                node_hint: Some(node.id.clone()),
                data: PartitionData::Batch { offset, size },
                estimated_latency_ms: latency,
                estimated_memory_bytes: u64::from(size) * ITEM_MEMORY_BYTES,
            });
            estimates.push((latency, size));
            offset += size;
            index += 1;
        }

        let (latency, throughput) = estimate_plan(&estimates);
        Ok(PartitionPlan {
            strategy: self.name().to_string(),
            partitions,
            dependencies: Vec::new(),
            estimated_latency_ms: latency,
            estimated_throughput: throughput,
            efficiency: allocation.efficiency,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use infermesh_core::types::{NodeUsage, TaskInput, TaskType};

    use crate::config::PartitionConfig;
    use crate::partition::test_support::{batch_task, make_node};

    use super::*;

    fn ctx<'a>(nodes: &'a [NodeInfo], config: &'a PartitionConfig) -> PartitionContext<'a> {
        PartitionContext {
            nodes,
            model_size_bytes: None,
            config,
        }
    }

    #[test]
    fn requires_two_eligible_nodes() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let task = batch_task(10);

        let one = vec![make_node("a", 1.0)];
        assert!(!strategy.can_handle(&task, &ctx(&one, &config)));

        let two = vec![make_node("a", 1.0), make_node("b", 1.0)];
        assert!(strategy.can_handle(&task, &ctx(&two, &config)));
    }

    #[test]
    fn overloaded_nodes_are_not_eligible() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let task = batch_task(10);

        let mut busy = make_node("a", 1.0);
        busy.usage = NodeUsage {
            memory_percent: 0.95,
            ..NodeUsage::default()
        };
        let mut queued = make_node("b", 1.0);
        queued.usage = NodeUsage {
            active_requests: 6,
            ..NodeUsage::default()
        };
        let nodes = vec![busy, queued, make_node("c", 1.0)];
        assert!(
            !strategy.can_handle(&task, &ctx(&nodes, &config)),
            "only one node is eligible"
        );
    }

    #[test]
    fn non_batchable_task_is_rejected() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let nodes = vec![make_node("a", 1.0), make_node("b", 1.0)];

        let mut task = batch_task(10);
        task.task_type = TaskType::Inference;
        task.batchable = None;
        assert!(!strategy.can_handle(&task, &ctx(&nodes, &config)));
    }

    #[test]
    fn allocation_follows_capacity_scores() {
        // Capacity scores {0.5, 0.3, 0.2} over a batch of 10 -> {5, 3, 2}.
        let config = PartitionConfig {
            max_partition_size: 10,
            ..PartitionConfig::default()
        };
        let strategy = DataSplitStrategy;
        let nodes = vec![
            make_node("a", 0.5),
            make_node("b", 0.3),
            make_node("c", 0.2),
        ];
        let task = batch_task(10);

        let plan = strategy.partition(&task, &ctx(&nodes, &config)).unwrap();

        let sizes: Vec<u32> = plan
            .partitions
            .iter()
            .map(|p| match p.data {
                PartitionData::Batch { size, .. } => size,
                _ => panic!("expected batch partitions"),
            })
            .collect();
        assert_eq!(sizes, vec![5, 3, 2]);
        assert!(plan.efficiency >= 0.95, "efficiency {}", plan.efficiency);
        assert_eq!(
            plan.partitions[0].node_hint.as_deref(),
            Some("a"),
            "highest-capacity node takes the largest slice"
        );
    }

    #[test]
    fn batch_sizes_sum_to_task_batch() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let nodes = vec![
            make_node("a", 0.9),
            make_node("b", 0.4),
            make_node("c", 0.7),
        ];
        let task = batch_task(23);

        let plan = strategy.partition(&task, &ctx(&nodes, &config)).unwrap();
        let total: u32 = plan
            .partitions
            .iter()
            .map(|p| match p.data {
                PartitionData::Batch { size, .. } => size,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 23);

        // Offsets tile the batch without gaps.
        let mut expected_offset = 0;
        for p in &plan.partitions {
            let PartitionData::Batch { offset, size } = p.data else {
                panic!("expected batch partitions");
            };
            assert_eq!(offset, expected_offset);
            expected_offset += size;
        }
    }

    #[test]
    fn empty_batch_yields_empty_plan() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let nodes = vec![make_node("a", 1.0), make_node("b", 1.0)];
        let mut task = batch_task(0);
        task.input = TaskInput::Batch { items: vec![] };

        let plan = strategy.partition(&task, &ctx(&nodes, &config)).unwrap();
        assert!(plan.is_empty());
        assert!(plan.estimated_throughput.abs() < f64::EPSILON);
    }

    #[test]
    fn data_split_has_no_dependencies() {
        let config = PartitionConfig::default();
        let strategy = DataSplitStrategy;
        let nodes = vec![make_node("a", 1.0), make_node("b", 1.0)];
        let plan = strategy
            .partition(&batch_task(8), &ctx(&nodes, &config))
            .unwrap();
        assert!(plan.dependencies.is_empty());
    }
}
