//! Partition engine.
//!
//! Decomposes one inference request into subtasks with an explicit
//! dependency DAG. Three built-in strategies cover layer-wise pipelines,
//! capacity-weighted data splits, and context-aware text splitting; the
//! engine scores them per task and picks the best fit.

pub mod context;
pub mod data_split;
pub mod engine;
pub mod layerwise;
pub mod strategy;
pub mod task_parallel;

pub use context::{ContextAwareStrategy, SEQUENTIAL_EDGE_STRENGTH};
pub use data_split::DataSplitStrategy;
pub use engine::{PartitionEngine, StrategyMetrics};
pub use layerwise::LayerwiseStrategy;
pub use task_parallel::TaskParallelStrategy;
pub use strategy::{
    estimate_latency_ms, estimate_plan, PartitionContext, PartitionStrategy, MERGE_OVERHEAD_MS,
    THROUGHPUT_EFFICIENCY,
};

// ---------------------------------------------------------------------------
// Shared test fixtures
// ---------------------------------------------------------------------------
