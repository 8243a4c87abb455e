//! HTTP handlers and shared application state.

pub mod distributed;
pub mod health;
pub mod inference;
pub mod models;

use std::sync::Arc;
use std::time::Instant;

use crate::balancer::LoadBalancer;
use crate::cluster::{ClusterManager, ClusterView, HealthChecker};
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::partition::PartitionEngine;
use crate::registry::{ModelRegistry, Replicator};

use super::shutdown::ShutdownController;

/// Server version reported by the API.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub view: Arc<ClusterView>,
    pub manager: Arc<ClusterManager>,
    pub health_checker: Arc<HealthChecker>,
    pub registry: Arc<ModelRegistry>,
    pub replicator: Arc<Replicator>,
    pub orchestrator: Arc<Orchestrator>,
    pub balancer: Arc<LoadBalancer>,
    pub partition_engine: Arc<PartitionEngine>,
    pub shutdown: Arc<ShutdownController>,
    pub start_time: Instant,
}

pub use distributed::{
    distributed_metrics_handler, distributed_models_handler, distributed_nodes_handler,
    distributed_requests_handler, distributed_status_handler, model_replicas_handler,
    replication_status_handler,
};
pub use health::{health_handler, liveness_handler, readiness_handler, version_handler};
pub use inference::{chat_handler, embed_handler, generate_handler};
pub use models::{
    copy_handler, create_handler, delete_handler, pull_handler, push_handler, show_handler,
    tags_handler,
};
