//! Selection outcome recording and per-task-type pattern learning.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use infermesh_core::types::{NodeId, TaskType};

use crate::util::ewma;

/// Ring buffer capacity for selection results.
pub const RESULT_BUFFER_CAP: usize = 1000;

/// Outcome of one node selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResult {
    pub task_type: TaskType,
    pub algorithm: &'static str,
    pub nodes: Vec<NodeId>,
    pub success: bool,
    pub latency_ms: f64,
    pub throughput: f64,
    pub at_ms: u64,
}

/// Learned performance pattern per task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPattern {
    pub ewma_latency_ms: f64,
    pub ewma_throughput: f64,
    /// Confidence in the pattern, in `[0.1, 1.0]`. Grows 1.1x on success,
    /// shrinks 0.9x on failure.
    pub confidence: f64,
}

/// Bounded history of selection outcomes plus the pattern table.
pub struct SelectionRecorder {
    results: Mutex<VecDeque<SelectionResult>>,
    patterns: Mutex<HashMap<TaskType, TaskPattern>>,
}

impl Default for SelectionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::with_capacity(RESULT_BUFFER_CAP)),
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a result, evicting the oldest past the cap, and folds it
    /// into the task type's pattern.
    pub fn record(&self, result: SelectionResult) {
        {
            let mut patterns = self.patterns.lock();
            let pattern = patterns
                .entry(result.task_type)
                .or_insert_with(|| TaskPattern {
                    ewma_latency_ms: result.latency_ms,
                    ewma_throughput: result.throughput,
                    confidence: 0.5,
                });
            pattern.ewma_latency_ms =
                ewma(Some(pattern.ewma_latency_ms), result.latency_ms, 0.3);
            pattern.ewma_throughput =
                ewma(Some(pattern.ewma_throughput), result.throughput, 0.3);
            pattern.confidence = if result.success {
                (pattern.confidence * 1.1).min(1.0)
            } else {
                (pattern.confidence * 0.9).max(0.1)
            };
        }

        let mut results = self.results.lock();
        if results.len() >= RESULT_BUFFER_CAP {
            results.pop_front();
        }
        results.push_back(result);
    }

    #[must_use]
    pub fn pattern(&self, task_type: TaskType) -> Option<TaskPattern> {
        self.patterns.lock().get(&task_type).cloned()
    }

    /// Most recent `n` results, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<SelectionResult> {
        self.results.lock().iter().rev().take(n).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
