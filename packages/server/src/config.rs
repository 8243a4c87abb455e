//! Server configuration.
//!
//! A single YAML file is the source of truth. Every section and field has a
//! default so a minimal file (or none at all) yields a runnable single-node
//! configuration; unknown fields are rejected to catch typos at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub node: NodeConfig,
    pub http: HttpConfig,
    pub p2p: P2pConfig,
    pub models: ModelsConfig,
    pub health: HealthConfig,
    pub balancer: BalancerConfig,
    pub partition: PartitionConfig,
    pub orchestrator: OrchestratorConfig,
    pub recovery: RecoveryConfig,
    pub autoscale: AutoscaleConfig,
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] if the file cannot be read or parsed,
    /// or if validation fails. Startup failures exit the process non-zero.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Fatal(format!("read config {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| ServerError::Fatal(format!("parse config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] describing the first violation.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.partition.min_partition_size > self.partition.max_partition_size {
            return Err(ServerError::Fatal(format!(
                "partition.min_partition_size {} exceeds max_partition_size {}",
                self.partition.min_partition_size, self.partition.max_partition_size
            )));
        }
        if self.models.replication_factor == 0 {
            return Err(ServerError::Fatal(
                "models.replication_factor must be at least 1".to_string(),
            ));
        }
        if self.autoscale.min_replicas > self.autoscale.max_replicas {
            return Err(ServerError::Fatal(format!(
                "autoscale.min_replicas {} exceeds max_replicas {}",
                self.autoscale.min_replicas, self.autoscale.max_replicas
            )));
        }
        if !(0.0..=1.0).contains(&self.recovery.rollback_threshold) {
            return Err(ServerError::Fatal(format!(
                "recovery.rollback_threshold {} outside [0, 1]",
                self.recovery.rollback_threshold
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Node identity and declared capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Stable node id. Empty means "generate one at startup".
    pub id: String,
    /// Address peers use to reach this node.
    pub address: String,
    pub capabilities: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: "127.0.0.1:15151".to_string(),
            capabilities: Vec::new(),
        }
    }
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11434,
            request_timeout_ms: 120_000,
        }
    }
}

/// Peer transport and replicated key-value log addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct P2pConfig {
    pub listen_addr: String,
    pub kv_log_addr: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15151".to_string(),
            kv_log_addr: "127.0.0.1:15152".to_string(),
        }
    }
}

/// Model storage and replication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelsConfig {
    pub storage_path: String,
    pub cache_size_bytes: u64,
    /// Minimum number of distinct nodes that should hold each model.
    pub replication_factor: u32,
    /// When `true`, `pull` waits for the replica invariant (up to the
    /// deadline) before responding.
    pub admission_blocking: bool,
    pub admission_deadline_ms: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: "./models".to_string(),
            cache_size_bytes: 8 << 30,
            replication_factor: 2,
            admission_blocking: false,
            admission_deadline_ms: 20_000,
        }
    }
}

/// Heartbeat, health check, and discovery cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    pub check_interval_ms: u64,
    pub discovery_interval_ms: u64,
    /// Budget for the `leave` announcement during shutdown.
    pub leave_budget_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            check_interval_ms: 10_000,
            discovery_interval_ms: 30_000,
            leave_budget_ms: 5_000,
            ping_timeout_ms: 2_000,
        }
    }
}

/// Load balancer algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerAlgorithmKind {
    WeightedRoundRobin,
    LeastEffectiveLoad,
    LocalityAware,
    Predictive,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BalancerConfig {
    pub algorithm: BalancerAlgorithmKind,
    /// When `true`, the adaptive selector may pick per-request algorithms;
    /// when `false`, `algorithm` is always used.
    pub adaptive: bool,
    pub prediction_enabled: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalancerAlgorithmKind::Adaptive,
            adaptive: true,
            prediction_enabled: true,
        }
    }
}

/// Partition engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PartitionConfig {
    /// Strategy preferred when candidate scores tie.
    pub default_strategy: String,
    /// Model size (bytes) above which layer-wise partitioning activates.
    pub layer_threshold_bytes: u64,
    /// Transformer layer count assumed when the model does not declare one.
    pub default_layer_count: u32,
    pub max_batch_size: u32,
    pub min_partition_size: u32,
    pub max_partition_size: u32,
    /// Context overlap in sentences for the context-aware splitter.
    pub overlap_size: u32,
    /// Character budget per context-aware partition.
    pub max_partition_chars: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            default_strategy: "data_split".to_string(),
            layer_threshold_bytes: 8 << 30,
            default_layer_count: 32,
            max_batch_size: 256,
            min_partition_size: 1,
            max_partition_size: 64,
            overlap_size: 1,
            max_partition_chars: 2048,
        }
    }
}

/// Orchestrator execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub task_timeout_ms: u64,
    /// Consecutive failures within the window that open a node's breaker.
    pub circuit_failure_threshold: u32,
    pub circuit_window_ms: u64,
    pub circuit_open_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            max_retries: 3,
            retry_backoff_ms: 5_000,
            task_timeout_ms: 300_000,
            circuit_failure_threshold: 5,
            circuit_window_ms: 60_000,
            circuit_open_ms: 30_000,
        }
    }
}

/// Recovery execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RecoveryConfig {
    /// Failure fraction beyond which a failing operation rolls back.
    pub rollback_threshold: f64,
    pub recovery_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub history_limit: usize,
    pub learning_enabled: bool,
    pub learning_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rollback_threshold: 0.5,
            recovery_timeout_ms: 120_000,
            monitor_interval_ms: 5_000,
            history_limit: 256,
            learning_enabled: true,
            learning_interval_ms: 60_000,
        }
    }
}

/// Autoscaler thresholds and cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub queue_threshold: u32,
    pub response_time_threshold_ms: f64,
    /// Items per second below which the throughput policy votes to scale up.
    pub throughput_floor: f64,
    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub evaluate_interval_ms: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_threshold: 0.8,
            memory_threshold: 0.85,
            queue_threshold: 50,
            response_time_threshold_ms: 150.0,
            throughput_floor: 1.0,
            scale_up_cooldown_ms: 180_000,
            scale_down_cooldown_ms: 300_000,
            min_replicas: 1,
            max_replicas: 16,
            evaluate_interval_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
