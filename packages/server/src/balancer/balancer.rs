//! Load balancer: constraint filtering, algorithm selection, and outcome
//! recording.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use infermesh_core::types::{DistributedTask, NodeInfo, TaskType};

use crate::config::{BalancerAlgorithmKind, BalancerConfig};
use crate::error::ServerError;
use crate::orchestrator::breaker::BreakerRegistry;
use crate::util::{ewma, now_ms};

use super::algorithms::{
    load_variance, AdaptiveBlend, BalancerAlgorithm, LeastEffectiveLoad, LocalityAware,
    PredictiveSelection, WeightedRoundRobin,
};
use super::constraints::{filter_nodes, Constraint};
use super::predictive::{PredictionSample, PredictiveModel};
use super::recorder::{SelectionRecorder, SelectionResult};

/// Load variance above which the adaptive selector switches to
/// least-effective-load.
const VARIANCE_SWITCH_THRESHOLD: f64 = 0.5;

/// A completed node selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub nodes: Vec<NodeInfo>,
    pub algorithm: &'static str,
}

/// Per-algorithm observable metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmMetrics {
    pub name: &'static str,
    pub selections: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Default, Clone)]
struct AlgorithmStats {
    selections: u64,
    successes: u64,
    outcomes: u64,
    ewma_latency_ms: Option<f64>,
}

/// Picks the node set for each request under capacity, locality, latency
/// and predictive-score constraints.
pub struct LoadBalancer {
    config: BalancerConfig,
    constraints: RwLock<Vec<Constraint>>,
    algorithms: HashMap<&'static str, Arc<dyn BalancerAlgorithm>>,
    predictive: Arc<PredictiveModel>,
    recorder: SelectionRecorder,
    breakers: Arc<BreakerRegistry>,
    stats: DashMap<&'static str, AlgorithmStats>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(config: BalancerConfig, breakers: Arc<BreakerRegistry>) -> Self {
        let predictive = Arc::new(PredictiveModel::new());
        let mut algorithms: HashMap<&'static str, Arc<dyn BalancerAlgorithm>> = HashMap::new();
        for algorithm in [
            Arc::new(WeightedRoundRobin::new()) as Arc<dyn BalancerAlgorithm>,
            Arc::new(LeastEffectiveLoad),
            Arc::new(LocalityAware),
            Arc::new(PredictiveSelection::new(Arc::clone(&predictive))),
            Arc::new(AdaptiveBlend),
        ] {
            algorithms.insert(algorithm.name(), algorithm);
        }
        Self {
            config,
            constraints: RwLock::new(Vec::new()),
            algorithms,
            predictive,
            recorder: SelectionRecorder::new(),
            breakers,
            stats: DashMap::new(),
        }
    }

    /// Registers a placement constraint at runtime.
    pub fn add_constraint(&self, constraint: Constraint) {
        self.constraints.write().push(constraint);
    }

    pub fn clear_constraints(&self) {
        self.constraints.write().clear();
    }

    #[must_use]
    pub fn constraints(&self) -> Vec<Constraint> {
        self.constraints.read().clone()
    }

    #[must_use]
    pub fn predictive(&self) -> Arc<PredictiveModel> {
        Arc::clone(&self.predictive)
    }

    #[must_use]
    pub fn recorder(&self) -> &SelectionRecorder {
        &self.recorder
    }

    fn algorithm_name_for(kind: BalancerAlgorithmKind) -> &'static str {
        match kind {
            BalancerAlgorithmKind::WeightedRoundRobin => "weighted_round_robin",
            BalancerAlgorithmKind::LeastEffectiveLoad => "least_effective_load",
            BalancerAlgorithmKind::LocalityAware => "locality_aware",
            BalancerAlgorithmKind::Predictive => "predictive",
            BalancerAlgorithmKind::Adaptive => "adaptive",
        }
    }

    /// Adaptive algorithm choice per the selection rules; fixed to the
    /// configured algorithm when adaptivity is off.
    fn choose_algorithm(&self, task: &DistributedTask, candidates: &[NodeInfo]) -> &'static str {
        if !self.config.adaptive {
            return Self::algorithm_name_for(self.config.algorithm);
        }
        if candidates.len() <= 2 {
            return "weighted_round_robin";
        }
        if load_variance(candidates) > VARIANCE_SWITCH_THRESHOLD {
            return "least_effective_load";
        }
        if task.task_type.is_latency_sensitive() {
            return "locality_aware";
        }
        if self.config.prediction_enabled {
            return "predictive";
        }
        "adaptive"
    }

    /// Selects up to `count` nodes for a task.
    ///
    /// Candidates are narrowed in order: schedulable status, closed circuit
    /// breaker, then the active constraints by priority. The surviving set
    /// is ranked by the chosen algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoEligibleNodes`] when no candidate survives
    /// filtering.
    pub fn select_nodes(
        &self,
        task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Result<Selection, ServerError> {
        let schedulable: Vec<NodeInfo> = candidates
            .iter()
            .filter(|n| n.status.is_schedulable())
            .filter(|n| !self.breakers.is_open(&n.id))
            .cloned()
            .collect();

        let admitted = filter_nodes(&schedulable, &self.constraints.read());
        if admitted.is_empty() {
            return Err(ServerError::NoEligibleNodes(format!(
                "0 of {} candidates admitted for task {}",
                candidates.len(),
                task.id
            )));
        }

        let name = self.choose_algorithm(task, &admitted);
        let algorithm = &self.algorithms[name];
        let nodes = algorithm.select(task, &admitted, count);
        if nodes.is_empty() {
            return Err(ServerError::NoEligibleNodes(format!(
                "algorithm {name} produced no selection for task {}",
                task.id
            )));
        }

        debug!(task_id = %task.id, algorithm = name, picked = nodes.len(), "nodes selected");
        self.stats.entry(name).or_default().selections += 1;
        metrics::counter!("balancer_selections", "algorithm" => name).increment(1);
        Ok(Selection { nodes, algorithm: name })
    }

    /// Feeds a dispatch outcome back into algorithm metrics, the pattern
    /// table, and the predictive history.
    pub fn record_outcome(
        &self,
        task_type: TaskType,
        algorithm: &'static str,
        nodes: &[NodeInfo],
        success: bool,
        latency_ms: f64,
        throughput: f64,
    ) {
        {
            let mut stats = self.stats.entry(algorithm).or_default();
            stats.outcomes += 1;
            if success {
                stats.successes += 1;
            }
            stats.ewma_latency_ms = Some(ewma(stats.ewma_latency_ms, latency_ms, 0.3));
        }

        self.recorder.record(SelectionResult {
            task_type,
            algorithm,
            nodes: nodes.iter().map(|n| n.id.clone()).collect(),
            success,
            latency_ms,
            throughput,
            at_ms: now_ms(),
        });

        for node in nodes {
            let predicted =
                self.predictive
                    .predict(&node.id, task_type, node.capacity.compute_score);
            self.predictive.record(
                &node.id,
                task_type,
                PredictionSample {
                    predicted_latency_ms: predicted.latency_ms,
                    actual_latency_ms: latency_ms,
                    predicted_throughput: predicted.throughput,
                    actual_throughput: throughput,
                },
            );
        }
    }

    /// Metrics for every registered algorithm.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn metrics(&self) -> Vec<AlgorithmMetrics> {
        let mut out: Vec<AlgorithmMetrics> = self
            .algorithms
            .keys()
            .copied()
            .map(|name| {
                let stats = self
                    .stats
                    .get(name)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                AlgorithmMetrics {
                    name,
                    selections: stats.selections,
                    success_rate: if stats.outcomes == 0 {
                        1.0
                    } else {
                        stats.successes as f64 / stats.outcomes as f64
                    },
                    avg_latency_ms: stats.ewma_latency_ms.unwrap_or(0.0),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(b.name));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use infermesh_core::types::{
        NodeCapacity, NodeStatus, NodeUsage, TaskInput, TaskType,
    };

    use crate::config::OrchestratorConfig;
    use crate::balancer::constraints::{ConstraintKind, ConstraintOp};

    use super::*;

    fn make_node(id: &str, compute: f64) -> NodeInfo {
        let mut node = NodeInfo::stub(id.to_string(), "addr".to_string(), 0);
        node.capacity = NodeCapacity {
            compute_score: compute,
            ..NodeCapacity::default()
        };
        node
    }

    fn task(task_type: TaskType) -> DistributedTask {
        DistributedTask::new(
            task_type,
            "llama3".to_string(),
            TaskInput::Prompt {
                text: "hi".to_string(),
            },
            0,
            30_000,
        )
    }

    fn balancer(config: BalancerConfig) -> LoadBalancer {
        LoadBalancer::new(
            config,
            Arc::new(BreakerRegistry::new(&OrchestratorConfig::default())),
        )
    }

    #[test]
    fn empty_candidate_set_is_no_eligible_nodes() {
        let lb = balancer(BalancerConfig::default());
        let err = lb.select_nodes(&task(TaskType::Inference), &[], 1).unwrap_err();
        assert!(matches!(err, ServerError::NoEligibleNodes(_)));
    }

    #[test]
    fn non_schedulable_nodes_are_filtered() {
        let lb = balancer(BalancerConfig::default());
        let mut offline = make_node("a", 1.0);
        offline.status = NodeStatus::Offline;
        let mut draining = make_node("b", 1.0);
        draining.status = NodeStatus::Draining;

        let err = lb
            .select_nodes(&task(TaskType::Inference), &[offline, draining], 1)
            .unwrap_err();
        assert!(matches!(err, ServerError::NoEligibleNodes(_)));
    }

    #[test]
    fn constraint_violators_are_never_returned() {
        let lb = balancer(BalancerConfig::default());
        lb.add_constraint(Constraint {
            kind: ConstraintKind::MemoryPercent,
            op: ConstraintOp::Lt,
            value: 0.8,
            priority: 10,
        });

        let mut fat = make_node("a", 10.0);
        fat.usage = NodeUsage {
            memory_percent: 0.95,
            ..NodeUsage::default()
        };
        let lean = make_node("b", 0.1);

        let selection = lb
            .select_nodes(&task(TaskType::Inference), &[fat, lean], 2)
            .unwrap();
        assert_eq!(selection.nodes.len(), 1);
        assert_eq!(selection.nodes[0].id, "b");
    }

    #[test]
    fn breaker_open_nodes_are_filtered() {
        let breakers = Arc::new(BreakerRegistry::new(&OrchestratorConfig {
            circuit_failure_threshold: 1,
            circuit_open_ms: 60_000,
            ..OrchestratorConfig::default()
        }));
        let lb = LoadBalancer::new(BalancerConfig::default(), Arc::clone(&breakers));
        breakers.record_failure("a");

        let selection = lb
            .select_nodes(
                &task(TaskType::Inference),
                &[make_node("a", 1.0), make_node("b", 1.0), make_node("c", 1.0)],
                3,
            )
            .unwrap();
        assert!(selection.nodes.iter().all(|n| n.id != "a"));
    }

    #[test]
    fn two_candidates_use_weighted_round_robin() {
        let lb = balancer(BalancerConfig::default());
        let selection = lb
            .select_nodes(
                &task(TaskType::Embedding),
                &[make_node("a", 1.0), make_node("b", 1.0)],
                1,
            )
            .unwrap();
        assert_eq!(selection.algorithm, "weighted_round_robin");
    }

    #[test]
    fn skewed_load_switches_to_least_effective_load() {
        let lb = balancer(BalancerConfig::default());
        let mut slammed = make_node("a", 1.0);
        slammed.usage = NodeUsage {
            cpu_percent: 1.0,
            gpu_percent: 1.0,
            active_requests: 64,
            queued_requests: 64,
            ..NodeUsage::default()
        };
        let nodes = vec![
            slammed,
            make_node("b", 1.0),
            make_node("c", 1.0),
        ];

        let selection = lb.select_nodes(&task(TaskType::Embedding), &nodes, 1).unwrap();
        assert_eq!(selection.algorithm, "least_effective_load");
        assert_ne!(selection.nodes[0].id, "a");
    }

    #[test]
    fn latency_sensitive_tasks_use_locality() {
        let lb = balancer(BalancerConfig::default());
        let nodes = vec![
            make_node("a", 1.0),
            make_node("b", 1.0),
            make_node("c", 1.0),
        ];
        let selection = lb.select_nodes(&task(TaskType::Inference), &nodes, 1).unwrap();
        assert_eq!(selection.algorithm, "locality_aware");
    }

    #[test]
    fn batch_tasks_use_prediction_when_enabled() {
        let lb = balancer(BalancerConfig::default());
        let nodes = vec![
            make_node("a", 1.0),
            make_node("b", 1.0),
            make_node("c", 1.0),
        ];
        let selection = lb.select_nodes(&task(TaskType::Embedding), &nodes, 1).unwrap();
        assert_eq!(selection.algorithm, "predictive");
    }

    #[test]
    fn adaptive_blend_is_the_fallback() {
        let lb = balancer(BalancerConfig {
            prediction_enabled: false,
            ..BalancerConfig::default()
        });
        let nodes = vec![
            make_node("a", 1.0),
            make_node("b", 1.0),
            make_node("c", 1.0),
        ];
        let selection = lb.select_nodes(&task(TaskType::Embedding), &nodes, 1).unwrap();
        assert_eq!(selection.algorithm, "adaptive");
    }

    #[test]
    fn non_adaptive_config_pins_the_algorithm() {
        let lb = balancer(BalancerConfig {
            algorithm: BalancerAlgorithmKind::LeastEffectiveLoad,
            adaptive: false,
            prediction_enabled: false,
        });
        let selection = lb
            .select_nodes(
                &task(TaskType::Inference),
                &[make_node("a", 1.0), make_node("b", 1.0)],
                1,
            )
            .unwrap();
        assert_eq!(selection.algorithm, "least_effective_load");
    }

    #[test]
    fn outcomes_update_metrics_and_pattern_table() {
        let lb = balancer(BalancerConfig::default());
        let nodes = vec![make_node("a", 1.0)];

        lb.record_outcome(TaskType::Inference, "adaptive", &nodes, true, 120.0, 8.0);
        lb.record_outcome(TaskType::Inference, "adaptive", &nodes, false, 300.0, 2.0);

        let metrics = lb.metrics();
        let adaptive = metrics.iter().find(|m| m.name == "adaptive").unwrap();
        assert!((adaptive.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(adaptive.avg_latency_ms > 0.0);

        let pattern = lb.recorder().pattern(TaskType::Inference).unwrap();
        assert!(pattern.ewma_latency_ms > 0.0);
        assert_eq!(lb.recorder().len(), 2);
    }
}
