//! Node selection algorithms.

use std::collections::HashMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use infermesh_core::types::{DistributedTask, NodeId, NodeInfo};

use super::predictive::PredictiveModel;

/// A registered selection algorithm.
///
/// `select` returns up to `count` distinct nodes from `candidates`, best
/// first. Candidates are pre-filtered (status, breakers, constraints);
/// algorithms only rank.
pub trait BalancerAlgorithm: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo>;
}

/// Composite load score used for ranking and the adaptive selector's
/// variance rule. Unlike `NodeUsage::effective_load` this is unclamped, so
/// heavily queued nodes keep separating.
#[must_use]
pub fn load_score(node: &NodeInfo) -> f64 {
    0.4 * node.usage.cpu_percent
        + 0.3 * node.usage.gpu_percent
        + 0.3 * node.usage.queue_pressure()
}

/// Population variance of `load_score` across candidates.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn load_variance(candidates: &[NodeInfo]) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }
    let n = candidates.len() as f64;
    let mean = candidates.iter().map(load_score).sum::<f64>() / n;
    candidates
        .iter()
        .map(|c| {
            let d = load_score(c) - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

// ---------------------------------------------------------------------------
// Weighted round robin
// ---------------------------------------------------------------------------

/// Smooth weighted round robin keyed by compute score.
///
/// Each pick advances every candidate's current weight by its compute
/// score, selects the highest, and debits it by the total -- the classic
/// smooth-WRR scheme, which interleaves picks proportionally without
/// bursts.
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<NodeId, f64>>,
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
        }
    }
}

impl BalancerAlgorithm for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select(
        &self,
        _task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo> {
        let mut current = self.current.lock();
        let mut chosen: Vec<NodeInfo> = Vec::new();

        for _ in 0..count.min(candidates.len()) {
            let remaining: Vec<&NodeInfo> = candidates
                .iter()
                .filter(|c| !chosen.iter().any(|n| n.id == c.id))
                .collect();
            let total: f64 = remaining
                .iter()
                .map(|c| c.capacity.compute_score.max(0.01))
                .sum();

            for c in &remaining {
                *current.entry(c.id.clone()).or_insert(0.0) +=
                    c.capacity.compute_score.max(0.01);
            }

            let Some(best) = remaining.iter().max_by_key(|c| {
                (
                    OrderedFloat(current.get(&c.id).copied().unwrap_or(0.0)),
                    std::cmp::Reverse(c.id.clone()),
                )
            }) else {
                break;
            };
            if let Some(w) = current.get_mut(&best.id) {
                *w -= total;
            }
            chosen.push((*best).clone());
        }
        chosen
    }
}

// ---------------------------------------------------------------------------
// Least effective load
// ---------------------------------------------------------------------------

/// Ranks candidates by composite load ascending, compute score descending.
pub struct LeastEffectiveLoad;

impl BalancerAlgorithm for LeastEffectiveLoad {
    fn name(&self) -> &'static str {
        "least_effective_load"
    }

    fn select(
        &self,
        _task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo> {
        let mut ranked: Vec<NodeInfo> = candidates.to_vec();
        ranked.sort_by_key(|c| {
            (
                OrderedFloat(load_score(c)),
                std::cmp::Reverse(OrderedFloat(c.capacity.compute_score)),
                c.id.clone(),
            )
        });
        ranked.truncate(count);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Locality aware
// ---------------------------------------------------------------------------

/// Prefers nodes already holding the task's model, then lowest measured
/// latency.
pub struct LocalityAware;

impl BalancerAlgorithm for LocalityAware {
    fn name(&self) -> &'static str {
        "locality_aware"
    }

    fn select(
        &self,
        task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo> {
        let mut ranked: Vec<NodeInfo> = candidates.to_vec();
        ranked.sort_by_key(|c| {
            let holds_model = c.models.iter().any(|m| m == &task.model);
            (
                std::cmp::Reverse(holds_model),
                OrderedFloat(c.latency_ms.unwrap_or(f64::MAX)),
                c.id.clone(),
            )
        });
        ranked.truncate(count);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Predictive
// ---------------------------------------------------------------------------

/// Ranks candidates by predicted latency from the history model.
pub struct PredictiveSelection {
    model: Arc<PredictiveModel>,
}

impl PredictiveSelection {
    #[must_use]
    pub fn new(model: Arc<PredictiveModel>) -> Self {
        Self { model }
    }
}

impl BalancerAlgorithm for PredictiveSelection {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn select(
        &self,
        task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo> {
        let mut ranked: Vec<NodeInfo> = candidates.to_vec();
        ranked.sort_by_key(|c| {
            let prediction =
                self.model
                    .predict(&c.id, task.task_type, c.capacity.compute_score);
            (OrderedFloat(prediction.latency_ms), c.id.clone())
        });
        ranked.truncate(count);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Adaptive blend
// ---------------------------------------------------------------------------

/// Blended score over load, latency, and compute capacity.
pub struct AdaptiveBlend;

impl BalancerAlgorithm for AdaptiveBlend {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(
        &self,
        _task: &DistributedTask,
        candidates: &[NodeInfo],
        count: usize,
    ) -> Vec<NodeInfo> {
        let max_compute = candidates
            .iter()
            .map(|c| c.capacity.compute_score)
            .fold(f64::MIN_POSITIVE, f64::max);

        let score = |c: &NodeInfo| {
            let load_term = 1.0 - load_score(c).min(1.0);
            let latency_term = 1.0 / (1.0 + c.latency_ms.unwrap_or(50.0) / 100.0);
            let compute_term = c.capacity.compute_score / max_compute;
            0.4 * load_term + 0.3 * latency_term + 0.3 * compute_term
        };

        let mut ranked: Vec<NodeInfo> = candidates.to_vec();
        ranked.sort_by_key(|c| (std::cmp::Reverse(OrderedFloat(score(c))), c.id.clone()));
        ranked.truncate(count);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
