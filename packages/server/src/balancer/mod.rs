//! Load balancing and placement.
//!
//! Constraint filtering, five selection algorithms (weighted round robin,
//! least effective load, locality aware, predictive, adaptive blend), the
//! adaptive per-request algorithm selector, and outcome recording that
//! feeds the predictive model and pattern table.

pub mod algorithms;
#[allow(clippy::module_inception)]
pub mod balancer;
pub mod constraints;
pub mod predictive;
pub mod recorder;

pub use algorithms::{
    load_score, load_variance, AdaptiveBlend, BalancerAlgorithm, LeastEffectiveLoad,
    LocalityAware, PredictiveSelection, WeightedRoundRobin,
};
pub use balancer::{AlgorithmMetrics, LoadBalancer, Selection};
pub use constraints::{filter_nodes, Constraint, ConstraintKind, ConstraintOp};
pub use predictive::{Prediction, PredictionSample, PredictiveModel};
pub use recorder::{SelectionRecorder, SelectionResult, TaskPattern, RESULT_BUFFER_CAP};
