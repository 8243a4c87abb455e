//! Strategy registry and score-based selection.

use std::cmp::Reverse;
use std::sync::Arc;

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use tracing::debug;

use infermesh_core::types::{DistributedTask, PartitionPlan};

use crate::config::PartitionConfig;
use crate::error::ServerError;
use crate::util::ewma;

use super::context::ContextAwareStrategy;
use super::data_split::DataSplitStrategy;
use super::layerwise::LayerwiseStrategy;
use super::strategy::{PartitionContext, PartitionStrategy};
use super::task_parallel::TaskParallelStrategy;

/// Latency ceiling used to normalize the latency term of the score.
const SCORE_LATENCY_CEILING_MS: f64 = 10_000.0;

/// Per-strategy outcome tracking.
#[derive(Debug, Default, Clone)]
struct StrategyStats {
    attempts: u64,
    successes: u64,
    ewma_latency_ms: Option<f64>,
}

impl StrategyStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            // Unused strategies start with a clean record.
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.successes as f64 / self.attempts as f64
            }
        }
    }
}

/// Observable per-strategy metrics.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMetrics {
    pub name: &'static str,
    pub usage_count: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub context_preservation: f64,
    pub score: f64,
}

/// Selects and runs the best-scoring partition strategy per task.
///
/// Score = `0.4·success_rate + 0.3·(1 − latency/10s, clamped) +
/// 0.3·context_preservation`. Ties prefer the configured default strategy,
/// then static priority, then name.
pub struct PartitionEngine {
    strategies: Vec<Arc<dyn PartitionStrategy>>,
    stats: DashMap<&'static str, StrategyStats>,
    config: PartitionConfig,
}

impl PartitionEngine {
    /// Creates an engine with the four built-in strategies registered.
    #[must_use]
    pub fn new(config: PartitionConfig) -> Self {
        Self::with_strategies(
            config,
            vec![
                Arc::new(LayerwiseStrategy),
                Arc::new(DataSplitStrategy),
                Arc::new(ContextAwareStrategy),
                Arc::new(TaskParallelStrategy),
            ],
        )
    }

    #[must_use]
    pub fn with_strategies(
        config: PartitionConfig,
        strategies: Vec<Arc<dyn PartitionStrategy>>,
    ) -> Self {
        Self {
            strategies,
            stats: DashMap::new(),
            config,
        }
    }

    fn score(&self, strategy: &dyn PartitionStrategy) -> f64 {
        let stats = self
            .stats
            .get(strategy.name())
            .map(|s| s.value().clone())
            .unwrap_or_default();
        let latency_term =
            1.0 - (stats.ewma_latency_ms.unwrap_or(0.0) / SCORE_LATENCY_CEILING_MS).clamp(0.0, 1.0);
        0.4 * stats.success_rate() + 0.3 * latency_term + 0.3 * strategy.context_preservation()
    }

    /// Partitions a task against the current node set.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PartitionFailure`] when no registered
    /// strategy accepts the task.
    pub fn partition(
        &self,
        task: &DistributedTask,
        ctx: &PartitionContext<'_>,
    ) -> Result<PartitionPlan, ServerError> {
        let mut candidates: Vec<&Arc<dyn PartitionStrategy>> = self
            .strategies
            .iter()
            .filter(|s| s.can_handle(task, ctx))
            .collect();

        if candidates.is_empty() {
            return Err(ServerError::PartitionFailure(format!(
                "no strategy supports task {} of type {:?}",
                task.id, task.task_type
            )));
        }

        candidates.sort_by_key(|s| {
            (
                Reverse(OrderedFloat(self.score(s.as_ref()))),
                Reverse(s.name() == self.config.default_strategy),
                Reverse(s.priority()),
                s.name(),
            )
        });
        let chosen = Arc::clone(candidates[0]);
        debug!(task_id = %task.id, strategy = chosen.name(), "partition strategy selected");

        let plan = chosen.partition(task, ctx)?;
        self.stats.entry(chosen.name()).or_default().attempts += 1;
        metrics::counter!("partition_plans_created", "strategy" => chosen.name()).increment(1);
        Ok(plan)
    }

    /// Feeds an execution outcome back into strategy scoring.
    pub fn record_outcome(&self, strategy_name: &str, latency_ms: f64, success: bool) {
        // Strategy names are interned statics; match against registrations.
        let Some(key) = self
            .strategies
            .iter()
            .map(|s| s.name())
            .find(|n| *n == strategy_name)
        else {
            return;
        };
        let mut stats = self.stats.entry(key).or_default();
        if success {
            stats.successes += 1;
        }
        stats.ewma_latency_ms = Some(ewma(stats.ewma_latency_ms, latency_ms, 0.3));
    }

    /// Current metrics for every registered strategy.
    #[must_use]
    pub fn metrics(&self) -> Vec<StrategyMetrics> {
        self.strategies
            .iter()
            .map(|s| {
                let stats = self
                    .stats
                    .get(s.name())
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                StrategyMetrics {
                    name: s.name(),
                    usage_count: stats.attempts,
                    success_rate: stats.success_rate(),
                    avg_latency_ms: stats.ewma_latency_ms.unwrap_or(0.0),
                    context_preservation: s.context_preservation(),
                    score: self.score(s.as_ref()),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
