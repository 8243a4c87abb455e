//! Composition root: builds every subsystem, routes inbound peer traffic,
//! spawns the periodic ticks, and runs the graceful shutdown ceremony.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use infermesh_core::messages::{AnnouncePayload, Envelope, PeerMessage, ReplicatePayload};
use infermesh_core::types::{NodeStatus, Subtask, SubtaskOutcome};

use crate::balancer::LoadBalancer;
use crate::cluster::{
    ClusterEvent, ClusterManager, ClusterView, DropOldestQueue, HealthChecker, StaticProbe,
    INGEST_QUEUE_DEPTH,
};
use crate::config::Config;
use crate::error::ServerError;
use crate::network::{AppState, NetworkModule, ShutdownController};
use crate::orchestrator::{
    Autoscaler, BreakerRegistry, ClusterMetricsSnapshot, FaultTolerance, NoopActuator,
    Orchestrator, RecoveryManager, ScalingAction, SystemIncident,
};
use crate::partition::PartitionEngine;
use crate::registry::{ModelRegistry, Replicator};
use crate::transport::{DedupFilter, InferenceRuntime, KvLog, PeerHandler, PeerTransport};

// ---------------------------------------------------------------------------
// PeerRouter
// ---------------------------------------------------------------------------

struct RouterBindings {
    manager: Arc<ClusterManager>,
    registry: Arc<ModelRegistry>,
    inference: Arc<dyn InferenceRuntime>,
    heartbeats: Arc<DropOldestQueue<infermesh_core::messages::HeartbeatPayload>>,
    announcements: mpsc::Sender<AnnouncePayload>,
}

/// Inbound RPC surface registered with the transport.
///
/// The transport needs a handler before the subsystems exist, so the
/// router starts unbound and is wired once construction completes;
/// envelopes arriving before then are dropped. Bindings sit behind an
/// `ArcSwapOption` so the per-envelope read path stays lock-free.
pub struct PeerRouter {
    bindings: ArcSwapOption<RouterBindings>,
    dedup: DedupFilter,
}

impl PeerRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bindings: ArcSwapOption::empty(),
            dedup: DedupFilter::new(),
        })
    }

    fn bind(&self, bindings: RouterBindings) {
        self.bindings.store(Some(Arc::new(bindings)));
    }

    fn bound(&self) -> Option<Arc<RouterBindings>> {
        self.bindings.load_full()
    }
}

#[async_trait]
impl PeerHandler for PeerRouter {
    async fn handle_envelope(&self, envelope: Envelope) {
        let Some(bindings) = self.bound() else {
            debug!(sender = %envelope.sender, "router unbound, dropping envelope");
            return;
        };
        if !self.dedup.admit(&envelope.sender, envelope.timestamp_ms) {
            metrics::counter!("transport_envelopes_deduplicated").increment(1);
            return;
        }

        match envelope.message {
            PeerMessage::Heartbeat(payload) => {
                // Overflow drops the oldest heartbeat: a newer one
                // supersedes it anyway.
                if bindings.heartbeats.push(payload) {
                    metrics::counter!("transport_heartbeats_dropped").increment(1);
                }
            }
            PeerMessage::Announce(payload) => {
                if payload.action == infermesh_core::messages::AnnounceAction::Leave {
                    self.dedup.forget(&payload.node.id);
                }
                // Announcement ordering matters; a full queue blocks the
                // producer rather than dropping.
                if bindings.announcements.send(payload).await.is_err() {
                    warn!("announcement channel closed");
                }
            }
            PeerMessage::Broadcast(payload) => {
                debug!(topic = %payload.topic, "peer broadcast received");
            }
            PeerMessage::CancelSubtask(payload) => {
                debug!(subtask = %payload.subtask_id, "cancel received for subtask");
                metrics::counter!("transport_subtask_cancels").increment(1);
            }
            PeerMessage::SubtaskResult(_)
            | PeerMessage::Ping(_)
            | PeerMessage::Pong(_)
            | PeerMessage::DispatchSubtask(_)
            | PeerMessage::Replicate(_) => {
                // Request/response traffic arrives through the dedicated
                // handler methods, not as loose envelopes.
            }
        }
    }

    async fn handle_dispatch(&self, subtask: Subtask) -> SubtaskOutcome {
        let Some(bindings) = self.bound() else {
            return SubtaskOutcome::Err {
                error: "node still starting".to_string(),
            };
        };
        match bindings.inference.execute(&subtask).await {
            Ok(result) => SubtaskOutcome::Ok { result },
            Err(e) => SubtaskOutcome::Err {
                error: e.to_string(),
            },
        }
    }

    async fn handle_replicate(&self, payload: ReplicatePayload) -> Result<(), ServerError> {
        let bindings = self
            .bound()
            .ok_or_else(|| ServerError::Transport("node still starting".to_string()))?;
        bindings.registry.receive_replica(payload).await?;
        bindings
            .manager
            .set_local_models(bindings.registry.local_model_names());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServerRuntime
// ---------------------------------------------------------------------------

/// A fully wired node.
pub struct ServerRuntime {
    config: Arc<Config>,
    view: Arc<ClusterView>,
    manager: Arc<ClusterManager>,
    health_checker: Arc<HealthChecker>,
    registry: Arc<ModelRegistry>,
    replicator: Arc<Replicator>,
    orchestrator: Arc<Orchestrator>,
    balancer: Arc<LoadBalancer>,
    partition_engine: Arc<PartitionEngine>,
    recovery: Arc<RecoveryManager>,
    autoscaler: Arc<Autoscaler>,
    network: NetworkModule,
    shutdown: Arc<ShutdownController>,
    tracker: TaskTracker,
    start_time: Instant,
    incident_rx: Mutex<Option<mpsc::Receiver<SystemIncident>>>,
    heartbeats: Arc<DropOldestQueue<infermesh_core::messages::HeartbeatPayload>>,
    announce_rx: Mutex<Option<mpsc::Receiver<AnnouncePayload>>>,
    kv: Arc<dyn KvLog>,
}

impl ServerRuntime {
    /// Builds a node. `attach` registers the inbound router with the
    /// transport layer and returns this node's transport handle.
    pub fn build(
        config: Config,
        attach: impl FnOnce(Arc<PeerRouter>) -> Arc<dyn PeerTransport>,
        kv: Arc<dyn KvLog>,
        inference: Arc<dyn InferenceRuntime>,
    ) -> Self {
        let config = Arc::new(config);
        let router = PeerRouter::new();
        let transport = attach(Arc::clone(&router));

        let local_id = if config.node.id.is_empty() {
            transport.local_node_id()
        } else {
            config.node.id.clone()
        };

        let (view, view_events) = ClusterView::new(&local_id);
        let view = Arc::new(view);

        let manager = Arc::new(ClusterManager::new(
            Arc::clone(&view),
            Arc::clone(&transport),
            config.node.clone(),
            config.health.clone(),
            Arc::new(StaticProbe::new(infermesh_core::types::NodeCapacity {
                cpu_cores: 8,
                memory_bytes: 32 << 30,
                disk_bytes: 1 << 40,
                gpu_count: 1,
                gpu_memory_bytes: 24 << 30,
                network_mbps: 10_000,
                compute_score: 1.0,
            })),
        ));
        let health_checker = Arc::new(HealthChecker::new(
            Arc::clone(&view),
            Arc::clone(&transport),
            &config.health,
        ));

        let registry = Arc::new(ModelRegistry::new(
            Arc::clone(&kv),
            &config.models.storage_path,
            &local_id,
            config.models.replication_factor,
        ));
        let replicator = Arc::new(Replicator::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&view),
        ));

        let breakers = Arc::new(BreakerRegistry::new(&config.orchestrator));
        let balancer = Arc::new(LoadBalancer::new(
            config.balancer.clone(),
            Arc::clone(&breakers),
        ));
        let partition_engine = Arc::new(PartitionEngine::new(config.partition.clone()));

        let (orchestrator, incident_rx) = Orchestrator::new(
            Arc::clone(&view),
            Arc::clone(&partition_engine),
            Arc::clone(&balancer),
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&breakers),
            config.orchestrator.clone(),
        );
        let orchestrator = Arc::new(orchestrator);

        let recovery = Arc::new(RecoveryManager::new(
            config.recovery.clone(),
            Arc::new(NoopActuator),
        ));
        let autoscaler = Arc::new(Autoscaler::new(config.autoscale.clone()));

        let network = NetworkModule::new(config.http.clone());
        let shutdown = network.shutdown_controller();

        let heartbeats = Arc::new(DropOldestQueue::new(INGEST_QUEUE_DEPTH));
        let (announce_tx, announce_rx) = mpsc::channel(INGEST_QUEUE_DEPTH);

        router.bind(RouterBindings {
            manager: Arc::clone(&manager),
            registry: Arc::clone(&registry),
            inference,
            heartbeats: Arc::clone(&heartbeats),
            announcements: announce_tx,
        });

        let runtime = Self {
            config,
            view,
            manager,
            health_checker,
            registry,
            replicator,
            orchestrator,
            balancer,
            partition_engine,
            recovery,
            autoscaler,
            network,
            shutdown,
            tracker: TaskTracker::new(),
            start_time: Instant::now(),
            incident_rx: Mutex::new(Some(incident_rx)),
            heartbeats,
            announce_rx: Mutex::new(Some(announce_rx)),
            kv,
        };
        runtime.spawn_event_watcher(view_events);
        runtime
    }

    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn manager(&self) -> Arc<ClusterManager> {
        Arc::clone(&self.manager)
    }

    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.view)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn recovery(&self) -> Arc<RecoveryManager> {
        Arc::clone(&self.recovery)
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            view: Arc::clone(&self.view),
            manager: Arc::clone(&self.manager),
            health_checker: Arc::clone(&self.health_checker),
            registry: Arc::clone(&self.registry),
            replicator: Arc::clone(&self.replicator),
            orchestrator: Arc::clone(&self.orchestrator),
            balancer: Arc::clone(&self.balancer),
            partition_engine: Arc::clone(&self.partition_engine),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        }
    }

    fn spawn_tick<F, Fut>(&self, name: &'static str, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let cancel = self.shutdown.cancel_token();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(tick = name, "tick loop stopped");
                        break;
                    }
                    _ = interval.tick() => f().await,
                }
            }
        });
    }

    fn spawn_event_watcher(&self, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        let view = Arc::clone(&self.view);
        let incidents = self.orchestrator.incident_sender();
        let health_checker = Arc::clone(&self.health_checker);
        let breakers = self.orchestrator.breakers();
        let predictive = self.balancer.predictive();
        let cancel = self.shutdown.cancel_token();

        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    ClusterEvent::StatusChanged { node_id, status }
                        if matches!(status, NodeStatus::Offline | NodeStatus::Failed) =>
                    {
                        if let Some(node) = view.get(&node_id) {
                            let failures = health_checker
                                .check_result(&node_id)
                                .map_or(0, |c| c.consecutive_failures);
                            let incident = SystemIncident::node_offline(&node, failures);
                            if incidents.try_send(incident).is_err() {
                                warn!("diagnosis queue full, dropping node incident");
                            }
                        }
                    }
                    ClusterEvent::NodeLeft(node_id) => {
                        health_checker.forget(&node_id);
                        breakers.forget(&node_id);
                        predictive.forget_node(&node_id);
                    }
                    _ => {}
                }
            }
        });
    }

    /// Spawns every background loop: heartbeat, health checks, discovery,
    /// ingest drains, KV applies, fault tolerance, recovery monitoring,
    /// learning, replication repair, and the autoscaler.
    pub fn spawn_background(&self) {
        let health = &self.config.health;

        // Heartbeat broadcast.
        {
            let manager = Arc::clone(&self.manager);
            let registry = Arc::clone(&self.registry);
            self.spawn_tick(
                "heartbeat",
                Duration::from_millis(health.heartbeat_interval_ms),
                move || {
                    let manager = Arc::clone(&manager);
                    let registry = Arc::clone(&registry);
                    async move {
                        manager.set_local_models(registry.local_model_names());
                        manager.send_heartbeat().await;
                    }
                },
            );
        }

        // Peer health checks.
        {
            let checker = Arc::clone(&self.health_checker);
            self.spawn_tick(
                "health_check",
                Duration::from_millis(health.check_interval_ms),
                move || {
                    let checker = Arc::clone(&checker);
                    async move { checker.check_all().await }
                },
            );
        }

        // Discovery reconciliation.
        {
            let manager = Arc::clone(&self.manager);
            self.spawn_tick(
                "discovery",
                Duration::from_millis(health.discovery_interval_ms),
                move || {
                    let manager = Arc::clone(&manager);
                    async move { manager.discovery_tick() }
                },
            );
        }

        // Replication repair.
        {
            let replicator = Arc::clone(&self.replicator);
            self.spawn_tick(
                "replication_repair",
                Duration::from_millis(health.discovery_interval_ms),
                move || {
                    let replicator = Arc::clone(&replicator);
                    async move { replicator.repair_pass().await }
                },
            );
        }

        // Recovery timeout monitor.
        {
            let recovery = Arc::clone(&self.recovery);
            self.spawn_tick(
                "recovery_monitor",
                Duration::from_millis(self.config.recovery.monitor_interval_ms),
                move || {
                    let recovery = Arc::clone(&recovery);
                    async move { recovery.monitor_tick() }
                },
            );
        }

        // Strategy learning.
        if self.config.recovery.learning_enabled {
            let recovery = Arc::clone(&self.recovery);
            self.spawn_tick(
                "recovery_learning",
                Duration::from_millis(self.config.recovery.learning_interval_ms),
                move || {
                    let recovery = Arc::clone(&recovery);
                    async move { recovery.relearn_priorities() }
                },
            );
        }

        // Popularity aging.
        {
            let registry = Arc::clone(&self.registry);
            self.spawn_tick(
                "popularity_refresh",
                Duration::from_millis(health.discovery_interval_ms),
                move || {
                    let registry = Arc::clone(&registry);
                    async move { registry.refresh_popularity() }
                },
            );
        }

        // Autoscaler evaluation.
        if self.config.autoscale.enabled {
            let autoscaler = Arc::clone(&self.autoscaler);
            let view = Arc::clone(&self.view);
            let balancer = Arc::clone(&self.balancer);
            self.spawn_tick(
                "autoscale",
                Duration::from_millis(self.config.autoscale.evaluate_interval_ms),
                move || {
                    let autoscaler = Arc::clone(&autoscaler);
                    let view = Arc::clone(&view);
                    let balancer = Arc::clone(&balancer);
                    async move {
                        let snapshot = snapshot_cluster(&view, &balancer);
                        let decision = autoscaler.evaluate(&snapshot);
                        if decision.action != ScalingAction::NoAction {
                            info!(
                                action = ?decision.action,
                                target = decision.target_replicas,
                                reason = %decision.reason,
                                "autoscale decision"
                            );
                            metrics::gauge!("autoscale_target_replicas")
                                .set(f64::from(decision.target_replicas));
                        }
                    }
                },
            );
        }

        // Heartbeat ingest drain.
        {
            let heartbeats = Arc::clone(&self.heartbeats);
            let manager = Arc::clone(&self.manager);
            let cancel = self.shutdown.cancel_token();
            self.tracker.spawn(async move {
                loop {
                    let payload = tokio::select! {
                        () = cancel.cancelled() => break,
                        payload = heartbeats.pop() => payload,
                    };
                    manager.handle_heartbeat(&payload);
                }
            });
        }

        // Announcement ingest drain (per-peer FIFO as delivered).
        if let Some(mut announce_rx) = self.announce_rx.lock().take() {
            let manager = Arc::clone(&self.manager);
            let cancel = self.shutdown.cancel_token();
            self.tracker.spawn(async move {
                loop {
                    let payload = tokio::select! {
                        () = cancel.cancelled() => break,
                        payload = announce_rx.recv() => match payload {
                            Some(payload) => payload,
                            None => break,
                        },
                    };
                    manager.handle_announcement(payload);
                }
            });
        }

        // Replicated-log applies refresh the model cache.
        {
            let mut applies = self.kv.subscribe();
            let registry = Arc::clone(&self.registry);
            let manager = Arc::clone(&self.manager);
            let cancel = self.shutdown.cancel_token();
            self.tracker.spawn(async move {
                loop {
                    let entry = tokio::select! {
                        () = cancel.cancelled() => break,
                        entry = applies.recv() => match entry {
                            Ok(entry) => entry,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "kv apply stream lagged");
                                continue;
                            }
                            Err(_) => break,
                        },
                    };
                    registry.apply_kv_entry(&entry);
                    manager.set_local_models(registry.local_model_names());
                }
            });
        }

        // Fault tolerance: incidents -> diagnosis -> recovery.
        if let Some(incident_rx) = self.incident_rx.lock().take() {
            let ft = FaultTolerance::new(Arc::clone(&self.recovery));
            let cancel = self.shutdown.cancel_token();
            self.tracker.spawn(async move {
                ft.run(incident_rx, cancel).await;
            });
        }
    }

    /// Brings the node up and serves HTTP until shutdown: registers the
    /// local node, warms the registry from the log, binds, spawns the
    /// background loops, and runs the leave ceremony on the way out.
    ///
    /// # Errors
    ///
    /// Propagates startup failures (`Fatal`); the binary exits non-zero.
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.registry.load_from_log().await?;
        self.manager
            .set_local_models(self.registry.local_model_names());
        self.manager.register_local().await.ok();

        let port = self.network.start().await?;
        info!(port, node_id = %self.view.local_id(), "node starting");

        self.spawn_background();
        let router = self.network.build_router(self.app_state());
        self.network.serve(router).await?;

        // Shutdown ceremony: leave the mesh within budget, stop loops,
        // drain handlers.
        self.manager.leave().await;
        self.tracker.close();
        self.shutdown.wait_for_drain(Duration::from_secs(5)).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.tracker.wait()).await;
        info!("node stopped");
        Ok(())
    }
}

/// Aggregates the live view into the autoscaler's input.
#[allow(clippy::cast_possible_truncation)]
fn snapshot_cluster(view: &ClusterView, balancer: &LoadBalancer) -> ClusterMetricsSnapshot {
    let nodes = view.all();
    let n = nodes.len().max(1) as f64;
    let avg_cpu = nodes.iter().map(|x| x.usage.cpu_percent).sum::<f64>() / n;
    let avg_memory = nodes.iter().map(|x| x.usage.memory_percent).sum::<f64>() / n;
    let queue_length: u32 = nodes.iter().map(|x| x.usage.queued_requests).sum();

    let pattern = balancer
        .recorder()
        .pattern(infermesh_core::types::TaskType::Inference);
    ClusterMetricsSnapshot {
        avg_cpu_percent: avg_cpu,
        avg_memory_percent: avg_memory,
        queue_length,
        avg_response_time_ms: pattern.as_ref().map_or(0.0, |p| p.ewma_latency_ms),
        throughput: pattern.as_ref().map_or(0.0, |p| p.ewma_throughput),
        current_replicas: nodes.len() as u32,
    }
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::time::Instant as TokioInstant;

    use infermesh_core::types::{DistributedTask, TaskInput, TaskType};

    use crate::registry::sha256_hex;
    use crate::transport::{EchoRuntime, InMemoryKvLog, LocalTransportHub};
    use crate::util::now_ms;

    use super::*;

    fn node_config(dir: &tempfile::TempDir, id: &str) -> Config {
        let mut config = Config::default();
        config.node.id = id.to_string();
        config.node.address = format!("127.0.0.1:{id}");
        config.models.storage_path = dir
            .path()
            .join(id)
            .to_string_lossy()
            .to_string();
        config.health.heartbeat_interval_ms = 50;
        config.health.check_interval_ms = 100;
        config.health.discovery_interval_ms = 100;
        config.orchestrator.retry_backoff_ms = 10;
        config
    }

    fn build_node(
        hub: &Arc<LocalTransportHub>,
        kv: &Arc<InMemoryKvLog>,
        dir: &tempfile::TempDir,
        id: &str,
    ) -> ServerRuntime {
        let config = node_config(dir, id);
        let address = config.node.address.clone();
        let hub2 = Arc::clone(hub);
        let id2 = id.to_string();
        ServerRuntime::build(
            config,
            move |router| Arc::new(hub2.attach(&id2, &address, router)),
            kv.clone() as Arc<dyn KvLog>,
            Arc::new(EchoRuntime::new(id)),
        )
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other_and_execute_work() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(LocalTransportHub::new());
        let kv = Arc::new(InMemoryKvLog::new());

        let node_a = build_node(&hub, &kv, &dir, "a");
        let node_b = build_node(&hub, &kv, &dir, "b");

        node_a.manager().register_local().await.unwrap();
        node_b.manager().register_local().await.unwrap();
        node_a.spawn_background();
        node_b.spawn_background();

        // Registering through a's registry becomes visible to b via the
        // replicated log.
        let data = b"weights".to_vec();
        let registry_a = node_a.registry();
        registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register("llama3", "/m", data.len() as u64, &sha256_hex(&data), "a")
            .await
            .unwrap();

        // Give the ingest loops a moment to drain.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(node_a.view().get("b").is_some());
        assert!(node_b.view().get("a").is_some());
        assert_eq!(node_b.registry().replica_count("llama3"), 1);

        // Execute a distributed batch across both nodes.
        let task = DistributedTask::new(
            TaskType::Embedding,
            "llama3".to_string(),
            TaskInput::Batch {
                items: (0..6).map(|i| serde_json::json!(i)).collect(),
            },
            now_ms(),
            30_000,
        );
        let result = node_a.orchestrator().execute(task).await.unwrap();
        assert_eq!(result["results"].as_array().unwrap().len(), 2);

        node_a.shutdown_controller().trigger_shutdown();
        node_b.shutdown_controller().trigger_shutdown();
    }

    #[tokio::test]
    async fn replication_repair_reaches_the_factor() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(LocalTransportHub::new());
        let kv = Arc::new(InMemoryKvLog::new());

        let node_a = build_node(&hub, &kv, &dir, "a");
        let node_b = build_node(&hub, &kv, &dir, "b");
        node_a.manager().register_local().await.unwrap();
        node_b.manager().register_local().await.unwrap();
        node_a.spawn_background();
        node_b.spawn_background();

        let data = b"weights".to_vec();
        let registry_a = node_a.registry();
        registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register("llama3", "/m", data.len() as u64, &sha256_hex(&data), "a")
            .await
            .unwrap();

        // Default factor is 2: the repair tick should replicate to b.
        let deadline = TokioInstant::now() + Duration::from_secs(3);
        while registry_a.replica_count("llama3") < 2 && TokioInstant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(
            registry_a.replica_count("llama3") >= 2,
            "replication factor not met in time"
        );

        node_a.shutdown_controller().trigger_shutdown();
        node_b.shutdown_controller().trigger_shutdown();
    }

    #[tokio::test]
    async fn subtask_failure_incident_drives_recovery_history() {
        /// Inference runtime that refuses every subtask.
        struct FailingRuntime;

        #[async_trait]
        impl InferenceRuntime for FailingRuntime {
            async fn execute(
                &self,
                _subtask: &Subtask,
            ) -> Result<serde_json::Value, ServerError> {
                Err(ServerError::SubtaskFailure("gpu wedged".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(LocalTransportHub::new());
        let kv = Arc::new(InMemoryKvLog::new());

        let config = node_config(&dir, "a");
        let address = config.node.address.clone();
        let hub2 = Arc::clone(&hub);
        let node_a = ServerRuntime::build(
            config,
            move |router| Arc::new(hub2.attach("a", &address, router)),
            kv.clone() as Arc<dyn KvLog>,
            Arc::new(FailingRuntime),
        );
        node_a.manager().register_local().await.unwrap();
        node_a.spawn_background();

        node_a
            .registry()
            .register("llama3", "/m", 4, "abc", "a")
            .await
            .unwrap();

        let task = DistributedTask::new(
            TaskType::Inference,
            "llama3".to_string(),
            TaskInput::Prompt {
                text: "Hello there.".to_string(),
            },
            now_ms(),
            10_000,
        );
        let err = node_a.orchestrator().execute(task).await.unwrap_err();
        assert!(matches!(err, ServerError::SubtaskFailure(_)));

        // The incident flows through diagnosis into a recorded recovery.
        let recovery = node_a.recovery();
        let deadline = TokioInstant::now() + Duration::from_secs(3);
        while recovery.history().is_empty() && TokioInstant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(recovery.history().len(), 1, "one recovery operation recorded");

        node_a.shutdown_controller().trigger_shutdown();
    }
}
