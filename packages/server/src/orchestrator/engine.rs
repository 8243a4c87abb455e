//! Task orchestration: partition, place, dispatch, aggregate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use infermesh_core::types::{
    DistributedTask, NodeId, NodeInfo, PartitionPlan, Subtask, SubtaskOutcome, SubtaskStatus,
    TaskStatus,
};

use crate::balancer::LoadBalancer;
use crate::cluster::{ClusterView, INGEST_QUEUE_DEPTH};
use crate::config::OrchestratorConfig;
use crate::error::ServerError;
use crate::partition::{PartitionContext, PartitionEngine};
use crate::registry::ModelRegistry;
use crate::transport::PeerTransport;
use crate::util::{ewma, now_ms};

use super::breaker::BreakerRegistry;
use super::fault::SystemIncident;

// ---------------------------------------------------------------------------
// Bookkeeping types
// ---------------------------------------------------------------------------

/// Orchestrator counters exposed on the metrics surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorCounters {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub subtasks_dispatched: u64,
    pub subtask_retries: u64,
    pub subtask_failures: u64,
    pub avg_task_latency_ms: f64,
}

/// Digest of one active task for the requests surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDigest {
    pub id: Uuid,
    pub task_type: infermesh_core::types::TaskType,
    pub model: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub strategy: Option<String>,
    pub subtask_total: usize,
    pub subtask_completed: usize,
    pub created_at_ms: u64,
}

struct ActiveTask {
    cancel: CancellationToken,
    task: Mutex<DistributedTask>,
}

/// Outcome of one subtask attempt chain.
struct SubtaskSuccess {
    subtask_id: Uuid,
    partition_index: u32,
    node_id: NodeId,
    result: serde_json::Value,
    duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives distributed task execution on chosen nodes.
///
/// Subtasks run in dependency order with at most `max_concurrent_tasks` in
/// flight; failures retry with exponential backoff onto alternative nodes,
/// feed per-node circuit breakers, and escalate to fault tolerance once
/// terminal.
pub struct Orchestrator {
    view: Arc<ClusterView>,
    partition_engine: Arc<PartitionEngine>,
    balancer: Arc<LoadBalancer>,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerRegistry>,
    config: OrchestratorConfig,
    active: DashMap<Uuid, Arc<ActiveTask>>,
    inflight: Arc<Semaphore>,
    incident_tx: mpsc::Sender<SystemIncident>,
    counters: Mutex<OrchestratorCounters>,
}

impl Orchestrator {
    /// Creates the orchestrator and returns the incident stream consumed
    /// by fault tolerance.
    pub fn new(
        view: Arc<ClusterView>,
        partition_engine: Arc<PartitionEngine>,
        balancer: Arc<LoadBalancer>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<ModelRegistry>,
        breakers: Arc<BreakerRegistry>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::Receiver<SystemIncident>) {
        let (incident_tx, incident_rx) = mpsc::channel(INGEST_QUEUE_DEPTH);
        let inflight = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        (
            Self {
                view,
                partition_engine,
                balancer,
                transport,
                registry,
                breakers,
                config,
                active: DashMap::new(),
                inflight,
                incident_tx,
                counters: Mutex::new(OrchestratorCounters::default()),
            },
            incident_rx,
        )
    }

    #[must_use]
    pub fn counters(&self) -> OrchestratorCounters {
        self.counters.lock().clone()
    }

    /// Sender half of the incident stream, for other incident sources
    /// (e.g. the cluster event watcher).
    #[must_use]
    pub fn incident_sender(&self) -> mpsc::Sender<SystemIncident> {
        self.incident_tx.clone()
    }

    #[must_use]
    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Digests of all currently active tasks.
    #[must_use]
    pub fn active_digest(&self) -> Vec<TaskDigest> {
        let mut digests: Vec<TaskDigest> = self
            .active
            .iter()
            .map(|entry| {
                let task = entry.value().task.lock();
                TaskDigest {
                    id: task.id,
                    task_type: task.task_type,
                    model: task.model.clone(),
                    status: task.status,
                    strategy: task.strategy.clone(),
                    subtask_total: task.subtasks.len(),
                    subtask_completed: task
                        .subtasks
                        .iter()
                        .filter(|s| s.status == SubtaskStatus::Completed)
                        .count(),
                    created_at_ms: task.created_at_ms,
                }
            })
            .collect();
        digests.sort_by_key(|d| d.created_at_ms);
        digests
    }

    /// Executes a task to completion and returns the aggregated result.
    ///
    /// # Errors
    ///
    /// Surfaces the §7 taxonomy: `NotFound` for unknown models,
    /// `PartitionFailure` when no strategy accepts the task,
    /// `NoEligibleNodes` after placement retries, `SubtaskFailure` after
    /// subtask retries, and `Timeout` when the task deadline elapses.
    pub async fn execute(
        self: &Arc<Self>,
        task: DistributedTask,
    ) -> Result<serde_json::Value, ServerError> {
        let task_id = task.id;
        let timeout = Duration::from_millis(task.timeout_ms);
        let started = Instant::now();

        let entry = Arc::new(ActiveTask {
            cancel: CancellationToken::new(),
            task: Mutex::new(task),
        });
        self.active.insert(task_id, Arc::clone(&entry));
        self.counters.lock().tasks_started += 1;
        metrics::counter!("orchestrator_tasks_started").increment(1);

        let result = tokio::time::timeout(timeout, self.run_task(&entry)).await;
        self.active.remove(&task_id);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let strategy = entry.task.lock().strategy.clone();
        let outcome = match result {
            Ok(Ok(value)) => {
                self.set_status(&entry, TaskStatus::Completed);
                let mut counters = self.counters.lock();
                counters.tasks_completed += 1;
                counters.avg_task_latency_ms =
                    ewma(Some(counters.avg_task_latency_ms), elapsed_ms, 0.3);
                metrics::histogram!("orchestrator_task_latency_ms").record(elapsed_ms);
                Ok(value)
            }
            Ok(Err(e)) => {
                let status = entry.task.lock().status;
                if status != TaskStatus::Cancelled {
                    self.set_status(&entry, TaskStatus::Failed);
                    self.counters.lock().tasks_failed += 1;
                }
                Err(e)
            }
            Err(_elapsed) => {
                entry.cancel.cancel();
                self.set_status(&entry, TaskStatus::Failed);
                self.counters.lock().tasks_failed += 1;
                Err(ServerError::Timeout(format!(
                    "task {task_id} exceeded {}ms",
                    timeout.as_millis()
                )))
            }
        };

        if let Some(strategy) = strategy {
            self.partition_engine
                .record_outcome(&strategy, elapsed_ms, outcome.is_ok());
        }
        outcome
    }

    /// Cancels a task. Cancellation propagates as cancel RPCs to every
    /// in-flight subtask. Cancelling a terminal or unknown task is a
    /// no-op that reports success.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), ServerError> {
        let Some(entry) = self.active.get(&task_id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };

        let in_flight: Vec<(NodeId, Uuid)> = {
            let mut task = entry.task.lock();
            task.status = TaskStatus::Cancelled;
            task.subtasks
                .iter_mut()
                .filter(|s| s.status == SubtaskStatus::Running)
                .map(|s| {
                    s.status = SubtaskStatus::Cancelled;
                    (s.node_id.clone(), s.id)
                })
                .collect()
        };
        entry.cancel.cancel();
        self.counters.lock().tasks_cancelled += 1;
        info!(task_id = %task_id, "task cancelled");

        for (node, subtask_id) in in_flight {
            if let Err(e) = self.transport.cancel_subtask(&node, subtask_id).await {
                debug!(node = %node, "cancel RPC failed (node may be gone): {e}");
            }
        }
        Ok(())
    }

    fn set_status(&self, entry: &ActiveTask, status: TaskStatus) {
        let mut task = entry.task.lock();
        if !task.status.is_terminal() {
            task.status = status;
            match status {
                TaskStatus::Running => task.started_at_ms = Some(now_ms()),
                s if s.is_terminal() => task.completed_at_ms = Some(now_ms()),
                _ => {}
            }
        }
    }

    // -- planning ----------------------------------------------------------

    fn plan(&self, entry: &ActiveTask) -> Result<PartitionPlan, ServerError> {
        let task = entry.task.lock().clone();
        self.registry.record_access(&task.model);
        let meta = self
            .registry
            .get(&task.model)
            .ok_or_else(|| ServerError::NotFound(format!("model {}", task.model)))?;

        let nodes = self.view.available();
        if nodes.is_empty() {
            return Err(ServerError::NoEligibleNodes(
                "no online nodes in the cluster view".to_string(),
            ));
        }

        let config = self.partition_engine.config().clone();
        let ctx = PartitionContext {
            nodes: &nodes,
            model_size_bytes: Some(meta.size_bytes),
            config: &config,
        };
        let plan = self.partition_engine.partition(&task, &ctx)?;

        let mut task = entry.task.lock();
        task.status = TaskStatus::Partitioned;
        task.strategy = Some(plan.strategy.clone());
        Ok(plan)
    }

    /// Materializes subtasks from a plan. Only `required` dependency edges
    /// order execution; advisory context edges stay in the plan.
    fn build_subtasks(entry: &ActiveTask, plan: &PartitionPlan) -> Vec<Subtask> {
        let mut task = entry.task.lock();
        let ids: HashMap<u32, Uuid> = plan
            .partitions
            .iter()
            .map(|p| (p.index, Uuid::new_v4()))
            .collect();

        let subtasks: Vec<Subtask> = plan
            .partitions
            .iter()
            .map(|p| {
                let dependencies: Vec<Uuid> = plan
                    .dependencies
                    .iter()
                    .filter(|d| d.required && d.to == p.index)
                    .filter_map(|d| ids.get(&d.from).copied())
                    .collect();
                Subtask {
                    id: ids[&p.index],
                    task_id: task.id,
                    node_id: p.node_hint.clone().unwrap_or_default(),
                    kind: p.kind(),
                    model: task.model.clone(),
                    payload: serde_json::to_value(&p.data).unwrap_or(serde_json::Value::Null),
                    status: SubtaskStatus::Pending,
                    started_at_ms: None,
                    completed_at_ms: None,
                    outcome: None,
                    dependencies,
                }
            })
            .collect();

        task.subtasks = subtasks.clone();
        task.nodes = subtasks
            .iter()
            .map(|s| s.node_id.clone())
            .filter(|n| !n.is_empty())
            .collect();
        task.status = TaskStatus::Scheduled;
        subtasks
    }

    // -- execution ---------------------------------------------------------

    async fn run_task(
        self: &Arc<Self>,
        entry: &Arc<ActiveTask>,
    ) -> Result<serde_json::Value, ServerError> {
        let plan = self.plan(entry)?;
        if plan.is_empty() {
            return Ok(serde_json::json!({
                "strategy": plan.strategy,
                "results": [],
            }));
        }

        let subtasks = Self::build_subtasks(entry, &plan);
        let index_of: HashMap<Uuid, u32> = entry
            .task
            .lock()
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, plan.partitions[i].index))
            .collect();
        self.set_status(entry, TaskStatus::Running);

        let template = Arc::new(entry.task.lock().clone());
        let mut pending: Vec<Subtask> = subtasks;
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut results: HashMap<u32, serde_json::Value> = HashMap::new();
        let mut join_set: JoinSet<Result<SubtaskSuccess, (Uuid, ServerError)>> = JoinSet::new();

        loop {
            // Launch every subtask whose dependencies are satisfied.
            let (ready, rest): (Vec<Subtask>, Vec<Subtask>) = pending
                .into_iter()
                .partition(|s| s.dependencies.iter().all(|d| completed.contains(d)));
            pending = rest;

            for subtask in ready {
                let this = Arc::clone(self);
                let template = Arc::clone(&template);
                let entry = Arc::clone(entry);
                let partition_index = index_of[&subtask.id];
                join_set.spawn(async move {
                    this.dispatch_with_retry(&template, &entry, subtask, partition_index)
                        .await
                });
            }

            if join_set.is_empty() {
                if pending.is_empty() {
                    break;
                }
                return Err(ServerError::PartitionFailure(format!(
                    "dependency cycle: {} subtasks can never become ready",
                    pending.len()
                )));
            }

            let joined = tokio::select! {
                () = entry.cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(ServerError::SubtaskFailure(
                        "task cancelled by caller".to_string(),
                    ));
                }
                joined = join_set.join_next() => joined,
            };

            match joined {
                Some(Ok(Ok(success))) => {
                    completed.insert(success.subtask_id);
                    results.insert(success.partition_index, success.result.clone());
                    self.mark_subtask(
                        entry,
                        success.subtask_id,
                        SubtaskStatus::Completed,
                        Some(SubtaskOutcome::Ok {
                            result: success.result,
                        }),
                        Some(&success.node_id),
                    );
                    debug!(
                        subtask = %success.subtask_id,
                        node = %success.node_id,
                        duration_ms = success.duration_ms,
                        "subtask completed"
                    );
                }
                Some(Ok(Err((subtask_id, error)))) => {
                    self.mark_subtask(
                        entry,
                        subtask_id,
                        SubtaskStatus::Failed,
                        Some(SubtaskOutcome::Err {
                            error: error.to_string(),
                        }),
                        None,
                    );
                    join_set.abort_all();
                    self.escalate_failure(entry, &error);
                    return Err(error);
                }
                Some(Err(join_error)) => {
                    join_set.abort_all();
                    return Err(ServerError::SubtaskFailure(format!(
                        "subtask worker panicked: {join_error}"
                    )));
                }
                None => {}
            }
        }

        // Results assemble in partition-index order.
        let mut ordered: Vec<(u32, serde_json::Value)> = results.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        Ok(serde_json::json!({
            "strategy": plan.strategy,
            "results": ordered.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        }))
    }

    fn mark_subtask(
        &self,
        entry: &ActiveTask,
        subtask_id: Uuid,
        status: SubtaskStatus,
        outcome: Option<SubtaskOutcome>,
        node_id: Option<&str>,
    ) {
        let mut task = entry.task.lock();
        if let Some(subtask) = task.subtasks.iter_mut().find(|s| s.id == subtask_id) {
            subtask.status = status;
            if status.is_terminal() {
                subtask.completed_at_ms = Some(now_ms());
            }
            if let Some(outcome) = outcome {
                subtask.outcome = Some(outcome);
            }
            if let Some(node_id) = node_id {
                subtask.node_id = node_id.to_string();
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_backoff_ms
            .saturating_mul(1u64 << attempt.min(8));
        // Up to 10% jitter so synchronized retries fan out.
        let jitter = rand::rng().random_range(0..=base / 10 + 1);
        Duration::from_millis(base + jitter)
    }

    /// One subtask's attempt chain: place, dispatch, retry with backoff.
    async fn dispatch_with_retry(
        self: Arc<Self>,
        template: &DistributedTask,
        entry: &Arc<ActiveTask>,
        mut subtask: Subtask,
        partition_index: u32,
    ) -> Result<SubtaskSuccess, (Uuid, ServerError)> {
        let subtask_id = subtask.id;
        let mut last_error =
            ServerError::SubtaskFailure(format!("subtask {subtask_id} never dispatched"));

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.counters.lock().subtask_retries += 1;
                metrics::counter!("orchestrator_subtask_retries").increment(1);
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            // Re-read the view each attempt: failed nodes have been marked
            // offline or breaker-opened since the last try.
            let candidates = self.view.available();
            let (node, algorithm) = match self.place(template, &subtask, &candidates, attempt) {
                Ok(placed) => placed,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            subtask.node_id = node.id.clone();

            let permit = self
                .inflight
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| (subtask_id, ServerError::Fatal("scheduler closed".into())))?;

            self.mark_subtask(entry, subtask_id, SubtaskStatus::Running, None, Some(&node.id));
            {
                let mut task = entry.task.lock();
                if let Some(s) = task.subtasks.iter_mut().find(|s| s.id == subtask_id) {
                    s.started_at_ms.get_or_insert_with(now_ms);
                }
            }
            self.counters.lock().subtasks_dispatched += 1;
            metrics::counter!("orchestrator_subtasks_dispatched").increment(1);

            let started = Instant::now();
            let dispatched = tokio::select! {
                () = entry.cancel.cancelled() => {
                    drop(permit);
                    return Err((
                        subtask_id,
                        ServerError::SubtaskFailure("task cancelled by caller".to_string()),
                    ));
                }
                result = self.transport.dispatch_subtask(&node.id, subtask.clone()) => result,
            };
            drop(permit);
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            let failure = match dispatched {
                Ok(SubtaskOutcome::Ok { result }) => {
                    self.breakers.record_success(&node.id);
                    self.balancer.record_outcome(
                        template.task_type,
                        algorithm,
                        &[node.clone()],
                        true,
                        duration_ms,
                        1000.0 / duration_ms.max(1.0),
                    );
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    return Ok(SubtaskSuccess {
                        subtask_id,
                        partition_index,
                        node_id: node.id,
                        result,
                        duration_ms: duration_ms as u64,
                    });
                }
                Ok(SubtaskOutcome::Err { error }) => ServerError::SubtaskFailure(error),
                Err(e) => e,
            };

            warn!(
                subtask = %subtask_id,
                node = %node.id,
                attempt,
                "subtask attempt failed: {failure}"
            );
            self.breakers.record_failure(&node.id);
            self.balancer.record_outcome(
                template.task_type,
                algorithm,
                &[node.clone()],
                false,
                duration_ms,
                0.0,
            );
            self.counters.lock().subtask_failures += 1;
            metrics::counter!("orchestrator_subtask_failures").increment(1);
            last_error = failure;
        }

        Err((subtask_id, last_error))
    }

    /// Picks the execution node for one attempt. The plan's node hint is
    /// honored on the first attempt when it passes the balancer's filters;
    /// afterwards placement is fully re-selected.
    fn place(
        &self,
        template: &DistributedTask,
        subtask: &Subtask,
        candidates: &[NodeInfo],
        attempt: u32,
    ) -> Result<(NodeInfo, &'static str), ServerError> {
        if attempt == 0 && !subtask.node_id.is_empty() {
            let hinted: Vec<NodeInfo> = candidates
                .iter()
                .filter(|n| n.id == subtask.node_id)
                .cloned()
                .collect();
            if !hinted.is_empty() {
                if let Ok(selection) = self.balancer.select_nodes(template, &hinted, 1) {
                    let node = selection.nodes.into_iter().next().expect("non-empty");
                    return Ok((node, selection.algorithm));
                }
            }
        }
        let selection = self.balancer.select_nodes(template, candidates, 1)?;
        let node = selection.nodes.into_iter().next().expect("non-empty");
        Ok((node, selection.algorithm))
    }

    /// Builds an incident from a terminal subtask failure and hands it to
    /// fault tolerance. A full diagnosis queue drops the incident in favor
    /// of keeping the scheduler responsive.
    #[allow(clippy::cast_precision_loss)]
    fn escalate_failure(&self, entry: &ActiveTask, error: &ServerError) {
        let task = entry.task.lock();
        let failing_node = task
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Failed)
            .map(|s| s.node_id.clone())
            .and_then(|id| self.view.get(&id));

        let running_ms = task
            .started_at_ms
            .map_or(0.0, |s| now_ms().saturating_sub(s) as f64);
        let incident = SystemIncident::subtask_failure(
            task.id,
            failing_node.as_ref(),
            &error.to_string(),
            running_ms,
        );
        drop(task);

        if self.incident_tx.try_send(incident).is_err() {
            warn!("diagnosis queue full, dropping incident");
            metrics::counter!("orchestrator_incidents_dropped").increment(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use infermesh_core::messages::{Envelope, ReplicatePayload};
    use infermesh_core::types::{NodeCapacity, TaskInput, TaskType};

    use crate::config::{BalancerConfig, PartitionConfig};
    use crate::transport::{InMemoryKvLog, LocalTransportHub, PeerHandler};

    use super::*;

    /// Executes every dispatch successfully, tagging the executing node.
    struct EchoHandler {
        node_id: String,
    }

    #[async_trait]
    impl PeerHandler for EchoHandler {
        async fn handle_envelope(&self, _envelope: Envelope) {}
        async fn handle_dispatch(&self, subtask: Subtask) -> SubtaskOutcome {
            SubtaskOutcome::Ok {
                result: serde_json::json!({
                    "node": self.node_id,
                    "model": subtask.model,
                }),
            }
        }
        async fn handle_replicate(&self, _payload: ReplicatePayload) -> Result<(), ServerError> {
            Ok(())
        }
    }

    /// Refuses every dispatch.
    struct RefusingHandler;

    #[async_trait]
    impl PeerHandler for RefusingHandler {
        async fn handle_envelope(&self, _envelope: Envelope) {}
        async fn handle_dispatch(&self, _subtask: Subtask) -> SubtaskOutcome {
            SubtaskOutcome::Err {
                error: "model not loaded".to_string(),
            }
        }
        async fn handle_replicate(&self, _payload: ReplicatePayload) -> Result<(), ServerError> {
            Ok(())
        }
    }

    struct Fixture {
        hub: Arc<LocalTransportHub>,
        view: Arc<ClusterView>,
        _registry: Arc<ModelRegistry>,
        orchestrator: Arc<Orchestrator>,
        _incidents: mpsc::Receiver<SystemIncident>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(peers: &[(&str, bool)], config: OrchestratorConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(LocalTransportHub::new());
        let (view, _rx) = ClusterView::new("coordinator");
        let view = Arc::new(view);

        let transport: Arc<dyn PeerTransport> = Arc::new(hub.attach(
            "coordinator",
            "127.0.0.1:0",
            Arc::new(EchoHandler {
                node_id: "coordinator".to_string(),
            }),
        ));

        for (id, healthy) in peers {
            let handler: Arc<dyn PeerHandler> = if *healthy {
                Arc::new(EchoHandler {
                    node_id: (*id).to_string(),
                })
            } else {
                Arc::new(RefusingHandler)
            };
            let _t = hub.attach(id, &format!("127.0.0.1:{id}"), handler);

            let mut node = NodeInfo::stub((*id).to_string(), format!("127.0.0.1:{id}"), 0);
            node.capacity = NodeCapacity {
                compute_score: 1.0,
                ..NodeCapacity::default()
            };
            view.upsert(node);
        }

        let registry = Arc::new(ModelRegistry::new(
            Arc::new(InMemoryKvLog::new()),
            dir.path().to_str().unwrap(),
            "coordinator",
            1,
        ));
        registry
            .register("llama3", "/m/llama3", 64, "abc", "coordinator")
            .await
            .unwrap();

        let breakers = Arc::new(BreakerRegistry::new(&config));
        let balancer = Arc::new(LoadBalancer::new(
            BalancerConfig::default(),
            Arc::clone(&breakers),
        ));
        let engine = Arc::new(PartitionEngine::new(PartitionConfig::default()));

        let (orchestrator, incidents) = Orchestrator::new(
            Arc::clone(&view),
            engine,
            balancer,
            transport,
            Arc::clone(&registry),
            breakers,
            config,
        );

        Fixture {
            hub,
            view,
            _registry: registry,
            orchestrator: Arc::new(orchestrator),
            _incidents: incidents,
            _dir: dir,
        }
    }

    fn batch_task(n: usize) -> DistributedTask {
        DistributedTask::new(
            TaskType::Embedding,
            "llama3".to_string(),
            TaskInput::Batch {
                items: (0..n).map(|i| serde_json::json!(i)).collect(),
            },
            now_ms(),
            30_000,
        )
    }

    #[tokio::test]
    async fn batch_task_completes_across_nodes() {
        let f = fixture(&[("a", true), ("b", true)], OrchestratorConfig::default()).await;

        let result = f.orchestrator.execute(batch_task(8)).await.unwrap();
        assert_eq!(result["strategy"], "data_split");
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 2, "one result per partition");

        let counters = f.orchestrator.counters();
        assert_eq!(counters.tasks_completed, 1);
        assert_eq!(counters.subtasks_dispatched, 2);
        assert_eq!(counters.tasks_failed, 0);
        assert!(f.orchestrator.active_digest().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let f = fixture(&[("a", true), ("b", true)], OrchestratorConfig::default()).await;
        let mut task = batch_task(4);
        task.model = "ghost".to_string();

        let err = f.orchestrator.execute(task).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_cluster_is_no_eligible_nodes() {
        let f = fixture(&[], OrchestratorConfig::default()).await;
        let err = f.orchestrator.execute(batch_task(4)).await.unwrap_err();
        assert!(matches!(err, ServerError::NoEligibleNodes(_)));
    }

    #[tokio::test]
    async fn empty_batch_completes_with_no_results() {
        let f = fixture(&[("a", true), ("b", true)], OrchestratorConfig::default()).await;
        let result = f.orchestrator.execute(batch_task(0)).await.unwrap();
        assert_eq!(result["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_node_retries_onto_healthy_peer() {
        // Node b refuses work; retries land on a and the task completes.
        let config = OrchestratorConfig {
            retry_backoff_ms: 100,
            ..OrchestratorConfig::default()
        };
        let f = fixture(&[("a", true), ("b", false)], config).await;

        let result = f.orchestrator.execute(batch_task(6)).await.unwrap();
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(
            results.iter().all(|r| r["node"] == "a"),
            "all work ended on the healthy node: {results:?}"
        );
        assert!(f.orchestrator.counters().subtask_retries >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_task() {
        let config = OrchestratorConfig {
            retry_backoff_ms: 10,
            max_retries: 2,
            ..OrchestratorConfig::default()
        };
        let f = fixture(&[("a", false), ("b", false)], config).await;

        let err = f.orchestrator.execute(batch_task(4)).await.unwrap_err();
        assert!(matches!(err, ServerError::SubtaskFailure(_)));
        assert_eq!(f.orchestrator.counters().tasks_failed, 1);
    }

    #[tokio::test]
    async fn cancel_on_unknown_task_is_a_noop_success() {
        let f = fixture(&[("a", true)], OrchestratorConfig::default()).await;
        f.orchestrator.cancel(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn task_deadline_maps_to_timeout() {
        /// Hangs forever on dispatch.
        struct HangingHandler;

        #[async_trait]
        impl PeerHandler for HangingHandler {
            async fn handle_envelope(&self, _envelope: Envelope) {}
            async fn handle_dispatch(&self, _subtask: Subtask) -> SubtaskOutcome {
                std::future::pending::<()>().await;
                unreachable!()
            }
            async fn handle_replicate(
                &self,
                _payload: ReplicatePayload,
            ) -> Result<(), ServerError> {
                Ok(())
            }
        }

        // The hanging node is the only candidate.
        let f = fixture(&[], OrchestratorConfig::default()).await;
        let _hang = f
            .hub
            .attach("hang", "127.0.0.1:h", Arc::new(HangingHandler));
        let mut node = NodeInfo::stub("hang".to_string(), "127.0.0.1:h".to_string(), 0);
        node.capacity.compute_score = 1.0;
        f.view.upsert(node);

        let mut task = DistributedTask::new(
            TaskType::Inference,
            "llama3".to_string(),
            TaskInput::Prompt {
                text: "One. Two.".to_string(),
            },
            now_ms(),
            500,
        );
        task.timeout_ms = 500;

        let err = f.orchestrator.execute(task).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn pipeline_dependencies_execute_in_order() {
        let f = fixture(&[("a", true), ("b", true)], OrchestratorConfig::default()).await;
        let mut task = batch_task(0);
        task.task_type = TaskType::Layerwise;
        task.input = TaskInput::Prompt {
            text: "run the stack".to_string(),
        };

        let result = f.orchestrator.execute(task).await.unwrap();
        assert_eq!(result["strategy"], "layerwise");
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 2, "one stage per node");
    }
}
