//! Layer-wise model partitioning for models too large for one node.

use infermesh_core::types::{
    DistributedTask, NodeInfo, Partition, PartitionData, PartitionPlan, PlanDependency, TaskType,
};

use crate::error::ServerError;

use super::strategy::{estimate_latency_ms, estimate_plan, PartitionContext, PartitionStrategy};

/// Splits a model's transformer stack into contiguous layer ranges, one
/// per node, sized proportionally to GPU memory. Ranges execute as a
/// pipeline: each range hard-depends on its predecessor.
pub struct LayerwiseStrategy;

impl LayerwiseStrategy {
    /// Nodes ordered by GPU memory descending (ties by id) -- the largest
    /// node anchors the embedding-heavy first range.
    fn pipeline_order(nodes: &[NodeInfo]) -> Vec<&NodeInfo> {
        let mut ordered: Vec<&NodeInfo> = nodes.iter().collect();
        ordered.sort_by(|a, b| {
            b.capacity
                .gpu_memory_bytes
                .cmp(&a.capacity.gpu_memory_bytes)
                .then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }

    #[allow(clippy::cast_precision_loss)]
    fn weight(node: &NodeInfo) -> f64 {
        if node.capacity.gpu_memory_bytes > 0 {
            node.capacity.gpu_memory_bytes as f64
        } else {
            node.capacity.compute_score.max(0.01)
        }
    }
}

impl PartitionStrategy for LayerwiseStrategy {
    fn name(&self) -> &'static str {
        "layerwise"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn context_preservation(&self) -> f64 {
        0.7
    }

    fn can_handle(&self, task: &DistributedTask, ctx: &PartitionContext<'_>) -> bool {
        if ctx.nodes.is_empty() {
            return false;
        }
        match task.task_type {
            TaskType::Layerwise => true,
            // Large models spill into layer-wise execution automatically.
            _ => {
                ctx.nodes.len() >= 2
                    && ctx
                        .model_size_bytes
                        .is_some_and(|size| size >= ctx.config.layer_threshold_bytes)
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn partition(
        &self,
        task: &DistributedTask,
        ctx: &PartitionContext<'_>,
    ) -> Result<PartitionPlan, ServerError> {
        let total_layers = ctx.config.default_layer_count;
        let nodes = Self::pipeline_order(ctx.nodes);
        let stages = nodes.len().min(total_layers as usize);
        if stages == 0 {
            return Err(ServerError::PartitionFailure(format!(
                "no nodes available for layerwise task {}",
                task.id
            )));
        }

        let total_weight: f64 = nodes[..stages].iter().map(|n| Self::weight(n)).sum();
        let per_layer_bytes = ctx
            .model_size_bytes
            .unwrap_or(ctx.config.layer_threshold_bytes)
            / u64::from(total_layers.max(1));

        let mut partitions = Vec::with_capacity(stages);
        let mut estimates = Vec::with_capacity(stages);
        let mut start = 0u32;
        for (i, node) in nodes[..stages].iter().enumerate() {
            let end = if i == stages - 1 {
                // Remainder lands on the final stage.
                total_layers
            } else {
                let share = Self::weight(node) / total_weight;
                let count = ((f64::from(total_layers) * share).round() as u32).max(1);
                (start + count).min(total_layers)
            };
            if start >= end {
                continue;
            }
            let layers = end - start;
            let latency = estimate_latency_ms(
                node.capacity.compute_score,
                layers,
                node.usage.effective_load(),
            );
            partitions.push(Partition {
                index: i as u32,
                node_hint: Some(node.id.clone()),
                data: PartitionData::Layers { start, end },
                estimated_latency_ms: latency,
                estimated_memory_bytes: u64::from(layers) * per_layer_bytes,
            });
            estimates.push((latency, layers));
            start = end;
        }

        // Pipeline stages are strictly ordered.
        let dependencies: Vec<PlanDependency> = (1..partitions.len())
            .map(|i| PlanDependency {
                from: (i - 1) as u32,
                to: i as u32,
                strength: 1.0,
                required: true,
            })
            .collect();

        let (latency, throughput) = estimate_plan(&estimates);
        Ok(PartitionPlan {
            strategy: self.name().to_string(),
            partitions,
            dependencies,
            estimated_latency_ms: latency,
            estimated_throughput: throughput,
            efficiency: 1.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use infermesh_core::types::TaskType;

    use crate::config::PartitionConfig;
    use crate::partition::test_support::{make_node, prompt_task};

    use super::*;

    fn ctx<'a>(
        nodes: &'a [NodeInfo],
        config: &'a PartitionConfig,
        model_size: Option<u64>,
    ) -> PartitionContext<'a> {
        PartitionContext {
            nodes,
            model_size_bytes: model_size,
            config,
        }
    }

    fn gpu_node(id: &str, gpu_memory_gib: u64) -> NodeInfo {
        let mut node = make_node(id, 1.0);
        node.capacity.gpu_memory_bytes = gpu_memory_gib << 30;
        node
    }

    #[test]
    fn explicit_layerwise_tasks_are_accepted() {
        let config = PartitionConfig::default();
        let strategy = LayerwiseStrategy;
        let nodes = vec![gpu_node("a", 24)];
        let mut task = prompt_task("hello");
        task.task_type = TaskType::Layerwise;
        assert!(strategy.can_handle(&task, &ctx(&nodes, &config, None)));
    }

    #[test]
    fn large_models_spill_into_layerwise() {
        let config = PartitionConfig::default();
        let strategy = LayerwiseStrategy;
        let nodes = vec![gpu_node("a", 24), gpu_node("b", 24)];
        let task = prompt_task("hello");

        let small = Some(config.layer_threshold_bytes - 1);
        let large = Some(config.layer_threshold_bytes);
        assert!(!strategy.can_handle(&task, &ctx(&nodes, &config, small)));
        assert!(strategy.can_handle(&task, &ctx(&nodes, &config, large)));
    }

    #[test]
    fn ranges_tile_all_layers_in_pipeline_order() {
        let config = PartitionConfig::default();
        let strategy = LayerwiseStrategy;
        let nodes = vec![gpu_node("a", 48), gpu_node("b", 24), gpu_node("c", 24)];
        let mut task = prompt_task("hello");
        task.task_type = TaskType::Layerwise;

        let plan = strategy.partition(&task, &ctx(&nodes, &config, None)).unwrap();

        // Ranges are contiguous from 0 to default_layer_count.
        let mut expected_start = 0;
        for p in &plan.partitions {
            let PartitionData::Layers { start, end } = p.data else {
                panic!("expected layer partitions");
            };
            assert_eq!(start, expected_start);
            assert!(end > start);
            expected_start = end;
        }
        assert_eq!(expected_start, config.default_layer_count);

        // Largest GPU node takes the first (largest) range.
        assert_eq!(plan.partitions[0].node_hint.as_deref(), Some("a"));
        let PartitionData::Layers { start, end } = plan.partitions[0].data else {
            panic!("expected layer partitions");
        };
        assert!(end - start >= config.default_layer_count / 3);
    }

    #[test]
    fn pipeline_edges_are_required_and_sequential() {
        let config = PartitionConfig::default();
        let strategy = LayerwiseStrategy;
        let nodes = vec![gpu_node("a", 24), gpu_node("b", 24)];
        let mut task = prompt_task("hello");
        task.task_type = TaskType::Layerwise;

        let plan = strategy.partition(&task, &ctx(&nodes, &config, None)).unwrap();
        assert_eq!(plan.dependencies.len(), plan.partitions.len() - 1);
        for dep in &plan.dependencies {
            assert!(dep.required);
            assert!((dep.strength - 1.0).abs() < f64::EPSILON);
            assert_eq!(dep.to, dep.from + 1);
        }
    }

    #[test]
    fn single_node_runs_whole_stack() {
        let config = PartitionConfig::default();
        let strategy = LayerwiseStrategy;
        let nodes = vec![gpu_node("a", 24)];
        let mut task = prompt_task("hello");
        task.task_type = TaskType::Layerwise;

        let plan = strategy.partition(&task, &ctx(&nodes, &config, None)).unwrap();
        assert_eq!(plan.partitions.len(), 1);
        let PartitionData::Layers { start, end } = plan.partitions[0].data else {
            panic!("expected layer partitions");
        };
        assert_eq!((start, end), (0, config.default_layer_count));
        assert!(plan.dependencies.is_empty());
    }
}
