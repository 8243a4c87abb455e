//! Cluster-wide domain types: node identity and resources, models, tasks,
//! subtasks, and partition plans.
//!
//! These types cross node boundaries (announcements, heartbeats, subtask
//! dispatch) and are published to the replicated key-value log, so every
//! struct is `serde`-serializable with `camelCase` field names to keep the
//! wire shape stable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node identifier. Assigned once at first startup and stable thereafter.
pub type NodeId = String;

// ---------------------------------------------------------------------------
// Node status and resources
// ---------------------------------------------------------------------------

/// Lifecycle status of a cluster node.
///
/// Receivers never trust a sender's self-reported status; the local health
/// checker is the only writer of this field for remote nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Online,
    Offline,
    Draining,
    Maintenance,
    Overloaded,
    Failed,
}

impl NodeStatus {
    /// Returns `true` if the node may be offered work by the scheduler.
    #[must_use]
    pub fn is_schedulable(self) -> bool {
        matches!(self, NodeStatus::Online)
    }
}

/// Static capacity of a node, declared by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub gpu_count: u32,
    pub gpu_memory_bytes: u64,
    /// Declared network bandwidth in megabits per second.
    pub network_mbps: u64,
    /// Relative throughput capability in (0, inf). Used as a latency scaler
    /// and tie-breaker by the scheduler.
    pub compute_score: f64,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            memory_bytes: 0,
            disk_bytes: 0,
            gpu_count: 0,
            gpu_memory_bytes: 0,
            network_mbps: 0,
            compute_score: 1.0,
        }
    }
}

/// Live utilization of a node, refreshed by heartbeats.
///
/// Percentages are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
    pub network_percent: f64,
    pub active_requests: u32,
    pub queued_requests: u32,
    pub load_average: f64,
}

impl NodeUsage {
    /// Queue pressure normalized to `[0, 1]`, saturating at 16 outstanding
    /// requests.
    #[must_use]
    pub fn queue_pressure(&self) -> f64 {
        f64::from(self.active_requests + self.queued_requests) / 16.0
    }

    /// Composite effective load: 0.4·cpu + 0.3·gpu + 0.3·queue pressure,
    /// clamped to `[0, 1]`.
    #[must_use]
    pub fn effective_load(&self) -> f64 {
        let load =
            0.4 * self.cpu_percent + 0.3 * self.gpu_percent + 0.3 * self.queue_pressure();
        load.clamp(0.0, 1.0)
    }
}

/// Full node record as announced and gossiped between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    /// Reachable address, `host:port`.
    pub address: String,
    pub status: NodeStatus,
    pub capacity: NodeCapacity,
    pub usage: NodeUsage,
    /// Names of models this node holds locally.
    pub models: Vec<String>,
    /// Declared capability tags (e.g. `"gpu"`, `"embedding"`).
    pub capabilities: Vec<String>,
    /// Last time this record was refreshed (ms since epoch).
    pub last_seen_ms: u64,
    /// Smoothed round-trip latency measured by the local health checker.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_ms: Option<f64>,
    /// Measured usable bandwidth toward this node, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bandwidth_mbps: Option<f64>,
}

impl NodeInfo {
    /// Creates a minimal stub record for a peer discovered through the
    /// transport before its first heartbeat arrives.
    #[must_use]
    pub fn stub(id: NodeId, address: String, now_ms: u64) -> Self {
        Self {
            id,
            address,
            status: NodeStatus::Online,
            capacity: NodeCapacity::default(),
            usage: NodeUsage::default(),
            models: Vec::new(),
            capabilities: Vec::new(),
            last_seen_ms: now_ms,
            latency_ms: None,
            bandwidth_mbps: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Registered model metadata, published on the replicated key-value log.
///
/// The replica list has set semantics: registering the same `(model, node)`
/// pair twice is a no-op. It only shrinks on explicit delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMeta {
    pub name: String,
    /// Filesystem path on the registering node.
    pub path: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the blob contents.
    pub checksum: String,
    /// Node IDs currently holding a verified replica. Ordered by insertion.
    pub replicas: Vec<NodeId>,
    pub replication_factor: u32,
    pub access_count: u64,
    pub last_accessed_ms: u64,
    /// Derived popularity score in `[0, 1]`.
    pub popularity: f64,
}

impl ModelMeta {
    /// Adds a replica holder if not already present. Returns `true` if the
    /// list changed.
    pub fn add_replica(&mut self, node_id: &str) -> bool {
        if self.replicas.iter().any(|n| n == node_id) {
            return false;
        }
        self.replicas.push(node_id.to_string());
        true
    }

    /// Removes a replica holder. Returns `true` if the list changed.
    pub fn remove_replica(&mut self, node_id: &str) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|n| n != node_id);
        self.replicas.len() != before
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Kind of distributed work a request decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Inference,
    Layerwise,
    DataSplit,
    TaskParallel,
    Embedding,
    Classification,
}

impl TaskType {
    /// Embedding and classification workloads are batchable by default;
    /// other kinds must be flagged explicitly on the task.
    #[must_use]
    pub fn is_batchable(self) -> bool {
        matches!(self, TaskType::Embedding | TaskType::Classification)
    }

    /// Interactive inference is latency-sensitive; batch kinds are not.
    #[must_use]
    pub fn is_latency_sensitive(self) -> bool {
        matches!(self, TaskType::Inference)
    }
}

/// Lifecycle of a distributed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Partitioned,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Lifecycle of a single subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Cancelled
        )
    }
}

/// A single chat turn, OpenAI/Ollama shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Input carried by a distributed task, by request shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Prompt { text: String },
    Messages { messages: Vec<ChatMessage> },
    Batch { items: Vec<serde_json::Value> },
}

impl TaskInput {
    /// Number of independently schedulable items in this input.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        match self {
            TaskInput::Prompt { .. } => 1,
            TaskInput::Messages { messages } => messages.len().max(1),
            TaskInput::Batch { items } => items.len(),
        }
    }

    /// Flattened text content, used by the context-aware splitter.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            TaskInput::Prompt { text } => text.clone(),
            TaskInput::Messages { messages } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            TaskInput::Batch { items } => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Success-or-error outcome of a finished subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubtaskOutcome {
    Ok { result: serde_json::Value },
    Err { error: String },
}

impl SubtaskOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, SubtaskOutcome::Ok { .. })
    }
}

/// One unit of partitioned work dispatched to a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Node currently responsible for executing this subtask.
    pub node_id: NodeId,
    pub kind: PartitionKind,
    pub model: String,
    /// Opaque execution payload interpreted by the inference runtime.
    pub payload: serde_json::Value,
    pub status: SubtaskStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<SubtaskOutcome>,
    /// Sibling subtask ids that must complete before this one starts.
    pub dependencies: Vec<Uuid>,
}

/// One distributed inference request, owned by the coordinating node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedTask {
    pub id: Uuid,
    pub task_type: TaskType,
    pub model: String,
    pub input: TaskInput,
    /// Name of the partition strategy chosen by the engine, once partitioned.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub strategy: Option<String>,
    /// Participating nodes in dispatch order.
    pub nodes: Vec<NodeId>,
    pub subtasks: Vec<Subtask>,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at_ms: Option<u64>,
    pub priority: u8,
    pub timeout_ms: u64,
    /// Overrides the default batchable flag derived from `task_type`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub batchable: Option<bool>,
}

impl DistributedTask {
    /// Creates a fresh task in `Pending` state.
    #[must_use]
    pub fn new(
        task_type: TaskType,
        model: String,
        input: TaskInput,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            model,
            input,
            strategy: None,
            nodes: Vec::new(),
            subtasks: Vec::new(),
            status: TaskStatus::Pending,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            priority: 0,
            timeout_ms,
            batchable: None,
        }
    }

    /// Whether this task may be split by batch. Explicit flag wins over the
    /// task-type default.
    #[must_use]
    pub fn is_batchable(&self) -> bool {
        self.batchable.unwrap_or_else(|| self.task_type.is_batchable())
    }
}

// ---------------------------------------------------------------------------
// Partition plans
// ---------------------------------------------------------------------------

/// Kind of partitioning applied to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Layer,
    Data,
    Context,
}

/// Kind-specific payload of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionData {
    /// Contiguous transformer layer range `[start, end)`.
    Layers { start: u32, end: u32 },
    /// Slice of the input batch starting at `offset` with `size` items.
    Batch { offset: u32, size: u32 },
    /// Text fragment with optional surrounding context for coherence.
    Text {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        context_before: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        context_after: Option<String>,
    },
}

/// One partition in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Position in the plan, also used as the dependency-edge key.
    pub index: u32,
    /// Scheduler hint naming a preferred node. The load balancer may
    /// override it when the hinted node fails a constraint.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_hint: Option<NodeId>,
    pub data: PartitionData,
    pub estimated_latency_ms: f64,
    pub estimated_memory_bytes: u64,
}

impl Partition {
    #[must_use]
    pub fn kind(&self) -> PartitionKind {
        match self.data {
            PartitionData::Layers { .. } => PartitionKind::Layer,
            PartitionData::Batch { .. } => PartitionKind::Data,
            PartitionData::Text { .. } => PartitionKind::Context,
        }
    }
}

/// Directed dependency edge between two partitions in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDependency {
    pub from: u32,
    pub to: u32,
    /// Coupling strength in `[0, 1]`; sequential context edges use 0.7.
    pub strength: f64,
    /// Whether execution must stall on this edge. Context edges are
    /// advisory (`false`).
    pub required: bool,
}

/// Output of the partition engine for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionPlan {
    /// Name of the strategy that produced this plan.
    pub strategy: String,
    pub partitions: Vec<Partition>,
    pub dependencies: Vec<PlanDependency>,
    pub estimated_latency_ms: f64,
    /// Estimated items per second across all partitions.
    pub estimated_throughput: f64,
    /// Allocation efficiency in `[0, 1]`, emitted for observability.
    pub efficiency: f64,
}

impl PartitionPlan {
    /// An empty plan: no partitions, zero throughput. Partitioning an empty
    /// batchable request yields this rather than an error.
    #[must_use]
    pub fn empty(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            partitions: Vec::new(),
            dependencies: Vec::new(),
            estimated_latency_ms: 0.0,
            estimated_throughput: 0.0,
            efficiency: 1.0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
