//! Per-(node, task type) latency and throughput prediction.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use infermesh_core::types::{NodeId, TaskType};

/// Samples retained per (node, task type) pair.
const HISTORY_CAP: usize = 50;

/// Samples inspected by the accuracy estimate.
const ACCURACY_WINDOW: usize = 10;

/// Relative error under which a prediction counts as accurate.
const ACCURACY_TOLERANCE: f64 = 0.2;

/// One recorded prediction-vs-outcome pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionSample {
    pub predicted_latency_ms: f64,
    pub actual_latency_ms: f64,
    pub predicted_throughput: f64,
    pub actual_throughput: f64,
}

/// Predicted performance for a dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub latency_ms: f64,
    pub throughput: f64,
}

/// History-backed predictor.
///
/// Predictions are linearly weighted means over the most recent samples
/// (newer samples weigh more). A pair with no history falls back to
/// `100ms / compute_score` latency and `compute_score * 10 ops/s`
/// throughput.
#[derive(Default)]
pub struct PredictiveModel {
    history: Mutex<HashMap<(NodeId, TaskType), VecDeque<PredictionSample>>>,
}

impl PredictiveModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Linearly weighted mean: sample `i` (oldest first) weighs `i + 1`.
    #[allow(clippy::cast_precision_loss)]
    fn weighted_mean(values: impl Iterator<Item = f64> + Clone) -> Option<f64> {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (i, v) in values.enumerate() {
            let w = (i + 1) as f64;
            weighted_sum += v * w;
            weight_total += w;
        }
        (weight_total > 0.0).then(|| weighted_sum / weight_total)
    }

    /// Predicts latency and throughput for running `task_type` on a node.
    #[must_use]
    pub fn predict(&self, node_id: &str, task_type: TaskType, compute_score: f64) -> Prediction {
        let history = self.history.lock();
        let samples = history.get(&(node_id.to_string(), task_type));

        match samples {
            Some(samples) if !samples.is_empty() => {
                let latency =
                    Self::weighted_mean(samples.iter().map(|s| s.actual_latency_ms))
                        .unwrap_or(0.0);
                let throughput =
                    Self::weighted_mean(samples.iter().map(|s| s.actual_throughput))
                        .unwrap_or(0.0);
                Prediction {
                    latency_ms: latency,
                    throughput,
                }
            }
            _ => Prediction {
                latency_ms: 100.0 / compute_score.max(0.01),
                throughput: compute_score * 10.0,
            },
        }
    }

    /// Records an observed outcome against the prediction made for it.
    pub fn record(&self, node_id: &str, task_type: TaskType, sample: PredictionSample) {
        let mut history = self.history.lock();
        let samples = history
            .entry((node_id.to_string(), task_type))
            .or_default();
        if samples.len() >= HISTORY_CAP {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Fraction of the last 10 samples whose predicted-vs-actual relative
    /// latency error is under 20%. A pair with no history reports 0.5
    /// (unknown), not 0.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn accuracy(&self, node_id: &str, task_type: TaskType) -> f64 {
        let history = self.history.lock();
        let Some(samples) = history.get(&(node_id.to_string(), task_type)) else {
            return 0.5;
        };
        if samples.is_empty() {
            return 0.5;
        }

        let recent: Vec<&PredictionSample> =
            samples.iter().rev().take(ACCURACY_WINDOW).collect();
        let accurate = recent
            .iter()
            .filter(|s| {
                let denom = s.actual_latency_ms.abs().max(f64::EPSILON);
                (s.predicted_latency_ms - s.actual_latency_ms).abs() / denom
                    < ACCURACY_TOLERANCE
            })
            .count();
        accurate as f64 / recent.len() as f64
    }

    /// Drops history for a departed node.
    pub fn forget_node(&self, node_id: &str) {
        self.history.lock().retain(|(id, _), _| id != node_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
