//! Context-aware text splitting strategy.

use infermesh_core::split::split_text;
use infermesh_core::types::{
    DistributedTask, NodeInfo, Partition, PartitionData, PartitionPlan, PlanDependency,
};

use crate::error::ServerError;

use super::strategy::{estimate_latency_ms, estimate_plan, PartitionContext, PartitionStrategy};

/// Strength of the advisory edge between adjacent text partitions.
pub const SEQUENTIAL_EDGE_STRENGTH: f64 = 0.7;

/// Splits long text inputs at sentence boundaries, carrying one sentence
/// of surrounding context per partition and chaining adjacent partitions
/// with advisory sequential edges.
pub struct ContextAwareStrategy;

impl ContextAwareStrategy {
    /// Nodes ordered by effective load (ties by id) for hint assignment.
    fn hint_order(nodes: &[NodeInfo]) -> Vec<&NodeInfo> {
        let mut ordered: Vec<&NodeInfo> = nodes.iter().collect();
        ordered.sort_by(|a, b| {
            a.usage
                .effective_load()
                .partial_cmp(&b.usage.effective_load())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }
}

impl PartitionStrategy for ContextAwareStrategy {
    fn name(&self) -> &'static str {
        "context_aware"
    }

    fn priority(&self) -> u8 {
        4
    }

    fn context_preservation(&self) -> f64 {
        0.9
    }

    fn can_handle(&self, task: &DistributedTask, ctx: &PartitionContext<'_>) -> bool {
        // Layer-parallel tasks split by weights, and batches are already
        // item-structured; only continuous text inputs split by sentence.
        task.task_type != infermesh_core::types::TaskType::Layerwise
            && matches!(
                task.input,
                infermesh_core::types::TaskInput::Prompt { .. }
                    | infermesh_core::types::TaskInput::Messages { .. }
            )
            && !ctx.nodes.is_empty()
            && !task.input.text().trim().is_empty()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn partition(
        &self,
        task: &DistributedTask,
        ctx: &PartitionContext<'_>,
    ) -> Result<PartitionPlan, ServerError> {
        let text = task.input.text();
        let chunks = split_text(
            &text,
            ctx.config.max_partition_chars,
            ctx.config.overlap_size as usize,
        );
        if chunks.is_empty() {
            return Ok(PartitionPlan::empty(self.name()));
        }

        let hints = Self::hint_order(ctx.nodes);
        if hints.is_empty() {
            return Err(ServerError::PartitionFailure(
                "no nodes available for text partitioning".to_string(),
            ));
        }

        let mut partitions = Vec::with_capacity(chunks.len());
        let mut estimates = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let node = hints[i % hints.len()];
            // Work scales with content volume; one "item" per 256 chars.
            let items = (chunk.content.len() as u32 / 256).max(1);
            let latency = estimate_latency_ms(
                node.capacity.compute_score,
                items,
                node.usage.effective_load(),
            );
            let memory = chunk.content.len() as u64 * 16;
            partitions.push(Partition {
                index: i as u32,
                node_hint: Some(node.id.clone()),
                data: PartitionData::Text {
                    content: chunk.content,
                    context_before: chunk.context_before,
                    context_after: chunk.context_after,
                },
                estimated_latency_ms: latency,
                estimated_memory_bytes: memory,
            });
            estimates.push((latency, items));
        }

        // Adjacent partitions get an advisory sequential edge.
        let dependencies: Vec<PlanDependency> = (1..partitions.len())
            .map(|i| PlanDependency {
                from: (i - 1) as u32,
                to: i as u32,
                strength: SEQUENTIAL_EDGE_STRENGTH,
                required: false,
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
    use infermesh_core::types::{TaskInput, TaskType};

    use crate::config::PartitionConfig;
    use crate::partition::test_support::{make_node, prompt_task};

    use super::*;

    fn ctx<'a>(nodes: &'a [NodeInfo], config: &'a PartitionConfig) -> PartitionContext<'a> {
        PartitionContext {
            nodes,
            model_size_bytes: None,
            config,
        }
    }

    #[test]
    fn rejects_empty_text_and_empty_cluster() {
        let config = PartitionConfig::default();
        let strategy = ContextAwareStrategy;
        let nodes = vec![make_node("a", 1.0)];

        assert!(!strategy.can_handle(&prompt_task("   "), &ctx(&nodes, &config)));
        assert!(!strategy.can_handle(&prompt_task("Hello."), &ctx(&[], &config)));
        assert!(strategy.can_handle(&prompt_task("Hello."), &ctx(&nodes, &config)));
    }

    #[test]
    fn six_sentences_with_small_budget_chain_sequentially() {
        // "A. B. C. D. E. F." with a 15-char budget and overlap 1: every
        // partition except the first carries context_before, every one
        // except the last carries context_after, and adjacent pairs are
        // chained by advisory edges.
        let config = PartitionConfig {
            max_partition_chars: 15,
            overlap_size: 1,
            ..PartitionConfig::default()
        };
        let strategy = ContextAwareStrategy;
        let nodes = vec![make_node("a", 1.0), make_node("b", 1.0)];
        let task = prompt_task("A. B. C. D. E. F.");

        let plan = strategy.partition(&task, &ctx(&nodes, &config)).unwrap();
        assert!(plan.partitions.len() >= 2);

        let last = plan.partitions.len() - 1;
        for (i, p) in plan.partitions.iter().enumerate() {
            let PartitionData::Text {
                context_before,
                context_after,
                ..
            } = &p.data
            else {
                panic!("expected text partitions");
            };
            assert_eq!(context_before.is_some(), i != 0, "partition {i} before");
            assert_eq!(context_after.is_some(), i != last, "partition {i} after");
        }

        assert_eq!(plan.dependencies.len(), plan.partitions.len() - 1);
        for (i, dep) in plan.dependencies.iter().enumerate() {
            assert_eq!(dep.from, i as u32);
            assert_eq!(dep.to, (i + 1) as u32);
            assert!((dep.strength - SEQUENTIAL_EDGE_STRENGTH).abs() < f64::EPSILON);
            assert!(!dep.required);
        }
    }

    #[test]
    fn zero_overlap_drops_context() {
        let config = PartitionConfig {
            max_partition_chars: 8,
            overlap_size: 0,
            ..PartitionConfig::default()
        };
        let strategy = ContextAwareStrategy;
        let nodes = vec![make_node("a", 1.0)];
        let plan = strategy
            .partition(&prompt_task("A. B. C. D."), &ctx(&nodes, &config))
            .unwrap();

        for p in &plan.partitions {
            let PartitionData::Text {
                context_before,
                context_after,
                ..
            } = &p.data
            else {
                panic!("expected text partitions");
            };
            assert!(context_before.is_none());
            assert!(context_after.is_none());
        }
    }

    #[test]
    fn hints_prefer_less_loaded_nodes() {
        let config = PartitionConfig {
            max_partition_chars: 4,
            ..PartitionConfig::default()
        };
        let strategy = ContextAwareStrategy;
        let mut busy = make_node("a", 1.0);
        busy.usage.cpu_percent = 0.9;
        busy.usage.gpu_percent = 0.9;
        let idle = make_node("b", 1.0);
        let nodes = vec![busy, idle];

        let plan = strategy
            .partition(&prompt_task("A. B. C."), &ctx(&nodes, &config))
            .unwrap();
        assert_eq!(
            plan.partitions[0].node_hint.as_deref(),
            Some("b"),
            "first chunk goes to the idle node"
        );
    }

    #[test]
    fn chat_messages_are_flattened_into_text() {
        let config = PartitionConfig {
            max_partition_chars: 10,
            ..PartitionConfig::default()
        };
        let strategy = ContextAwareStrategy;
        let nodes = vec![make_node("a", 1.0)];

        let mut task = prompt_task("");
        task.task_type = TaskType::Inference;
        task.input = TaskInput::Messages {
            messages: vec![
                infermesh_core::types::ChatMessage {
                    role: "user".to_string(),
                    content: "First question.".to_string(),
                },
                infermesh_core::types::ChatMessage {
                    role: "assistant".to_string(),
                    content: "An answer.".to_string(),
                },
            ],
        };

        assert!(strategy.can_handle(&task, &ctx(&nodes, &config)));
        let plan = strategy.partition(&task, &ctx(&nodes, &config)).unwrap();
        assert!(!plan.is_empty());
    }
}
