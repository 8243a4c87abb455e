//! Background replication fan-out.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use infermesh_core::messages::ReplicatePayload;
use infermesh_core::types::NodeId;

use crate::cluster::ClusterView;
use crate::error::ServerError;
use crate::transport::PeerTransport;

use super::registry::ModelRegistry;

/// Streams model blobs to peers missing them.
///
/// No mutual exclusion exists across fan-out jobs for different models;
/// per `{model, peer}` there is at most one in-flight transfer, enforced
/// by the single-flight table.
pub struct Replicator {
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn PeerTransport>,
    view: Arc<ClusterView>,
    inflight: DashMap<(String, NodeId), ()>,
}

impl Replicator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn PeerTransport>,
        view: Arc<ClusterView>,
    ) -> Self {
        Self {
            registry,
            transport,
            view,
            inflight: DashMap::new(),
        }
    }

    /// Number of transfers currently in flight, for the replication status
    /// surface.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Replicates `name` to each of `peers` that does not already hold it.
    /// Returns the number of peers that newly verified a replica.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] for unknown models. Per-peer
    /// transfer failures are logged and skipped, not propagated -- the
    /// replication monitor retries on its next pass.
    pub async fn replicate_to_peers(
        &self,
        name: &str,
        peers: &[NodeId],
    ) -> Result<usize, ServerError> {
        let meta = self
            .registry
            .get(name)
            .ok_or_else(|| ServerError::NotFound(format!("model {name}")))?;

        let mut replicated = 0;
        for peer in peers {
            if meta.replicas.iter().any(|n| n == peer) {
                continue;
            }

            // Single-flight per {model, peer}.
            let key = (name.to_string(), peer.clone());
            if self.inflight.insert(key.clone(), ()).is_some() {
                debug!(model = name, peer = %peer, "transfer already in flight, skipping");
                continue;
            }

            let result = self.transfer(&meta.checksum, name, peer).await;
            self.inflight.remove(&key);

            match result {
                Ok(()) => {
                    self.registry.add_replica(name, peer).await?;
                    metrics::counter!("registry_replicas_sent").increment(1);
                    info!(model = name, peer = %peer, "replica verified");
                    replicated += 1;
                }
                Err(e) => {
                    metrics::counter!("registry_replication_failures").increment(1);
                    warn!(model = name, peer = %peer, "replication failed: {e}");
                }
            }
        }
        Ok(replicated)
    }

    async fn transfer(&self, checksum: &str, name: &str, peer: &str) -> Result<(), ServerError> {
        let data = self.registry.store().read(name).await?;
        let payload = ReplicatePayload {
            model: name.to_string(),
            size_bytes: data.len() as u64,
            checksum: checksum.to_string(),
            data,
        };
        self.transport.replicate(peer, payload).await
    }

    /// Brings one model up to its replication factor using online peers.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] for unknown models.
    pub async fn ensure_replication(&self, name: &str) -> Result<usize, ServerError> {
        let meta = self
            .registry
            .get(name)
            .ok_or_else(|| ServerError::NotFound(format!("model {name}")))?;

        let missing =
            (meta.replication_factor as usize).saturating_sub(meta.replicas.len());
        if missing == 0 {
            return Ok(0);
        }

        // Deterministic target order: online non-holders sorted by id.
        let mut candidates: Vec<NodeId> = self
            .view
            .available()
            .into_iter()
            .map(|n| n.id)
            .filter(|id| !meta.replicas.iter().any(|r| r == id))
            .collect();
        candidates.sort();
        candidates.truncate(missing);

        self.replicate_to_peers(name, &candidates).await
    }

    /// One pass over every under-replicated model. Driven by a periodic
    /// tick and after each registration.
    pub async fn repair_pass(&self) {
        for meta in self.registry.under_replicated() {
            if let Err(e) = self.ensure_replication(&meta.name).await {
                warn!(model = %meta.name, "repair pass failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use infermesh_core::messages::Envelope;
    use infermesh_core::types::{NodeInfo, Subtask, SubtaskOutcome};

    use crate::registry::registry::sha256_hex;
    use crate::transport::{InMemoryKvLog, LocalTransportHub, PeerHandler};

    use super::*;

    /// Peer-side handler backed by a real registry, as in production.
    struct ReplicaHandler {
        registry: Mutex<Option<Arc<ModelRegistry>>>,
    }

    impl ReplicaHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                registry: Mutex::new(None),
            })
        }
        fn bind(&self, registry: Arc<ModelRegistry>) {
            *self.registry.lock() = Some(registry);
        }
    }

    #[async_trait]
    impl PeerHandler for ReplicaHandler {
        async fn handle_envelope(&self, _envelope: Envelope) {}
        async fn handle_dispatch(&self, _subtask: Subtask) -> SubtaskOutcome {
            SubtaskOutcome::Ok {
                result: serde_json::Value::Null,
            }
        }
        async fn handle_replicate(&self, payload: ReplicatePayload) -> Result<(), ServerError> {
            let registry = self.registry.lock().clone().expect("registry bound");
            registry.receive_replica(payload).await
        }
    }

    struct Mesh {
        hub: Arc<LocalTransportHub>,
        kv: Arc<InMemoryKvLog>,
        view: Arc<ClusterView>,
    }

    impl Mesh {
        fn new() -> Self {
            let (view, _rx) = ClusterView::new("node-a");
            Self {
                hub: Arc::new(LocalTransportHub::new()),
                kv: Arc::new(InMemoryKvLog::new()),
                view: Arc::new(view),
            }
        }

        fn add_node(
            &self,
            id: &str,
            dir: &tempfile::TempDir,
        ) -> (Arc<ModelRegistry>, Arc<dyn PeerTransport>) {
            let handler = ReplicaHandler::new();
            let transport: Arc<dyn PeerTransport> = Arc::new(self.hub.attach(
                id,
                &format!("127.0.0.1:{id}"),
                handler.clone(),
            ));
            let registry = Arc::new(ModelRegistry::new(
                self.kv.clone(),
                dir.path().join(id).to_str().unwrap(),
                id,
                2,
            ));
            handler.bind(Arc::clone(&registry));
            self.view
                .upsert(NodeInfo::stub(id.to_string(), format!("127.0.0.1:{id}"), 0));
            (registry, transport)
        }
    }

    #[tokio::test]
    async fn fan_out_replicates_and_appends_replica() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::new();
        let (registry_a, transport_a) = mesh.add_node("node-a", &dir);
        let (registry_b, _transport_b) = mesh.add_node("node-b", &dir);

        // Seed the blob on node-a.
        let data = b"weights".to_vec();
        let checksum = sha256_hex(&data);
        let path = registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register(
                "llama3",
                &path.to_string_lossy(),
                data.len() as u64,
                &checksum,
                "node-a",
            )
            .await
            .unwrap();

        let replicator = Replicator::new(
            Arc::clone(&registry_a),
            transport_a,
            Arc::clone(&mesh.view),
        );
        let replicated = replicator
            .replicate_to_peers("llama3", &["node-b".to_string()])
            .await
            .unwrap();

        assert_eq!(replicated, 1);
        assert_eq!(registry_a.replica_count("llama3"), 2);
        // Peer stored and registered the blob locally too.
        assert_eq!(registry_b.store().read("llama3").await.unwrap(), data);
        assert_eq!(replicator.inflight_count(), 0);
    }

    #[tokio::test]
    async fn peers_already_holding_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::new();
        let (registry_a, transport_a) = mesh.add_node("node-a", &dir);

        let data = b"weights".to_vec();
        let checksum = sha256_hex(&data);
        registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register("llama3", "/m", data.len() as u64, &checksum, "node-a")
            .await
            .unwrap();

        let replicator =
            Replicator::new(Arc::clone(&registry_a), transport_a, Arc::clone(&mesh.view));
        let replicated = replicator
            .replicate_to_peers("llama3", &["node-a".to_string()])
            .await
            .unwrap();
        assert_eq!(replicated, 0);
    }

    #[tokio::test]
    async fn unreachable_peer_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::new();
        let (registry_a, transport_a) = mesh.add_node("node-a", &dir);
        let (_registry_b, _tb) = mesh.add_node("node-b", &dir);
        mesh.hub.set_unreachable("node-b", true);

        let data = b"weights".to_vec();
        let checksum = sha256_hex(&data);
        registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register("llama3", "/m", data.len() as u64, &checksum, "node-a")
            .await
            .unwrap();

        let replicator =
            Replicator::new(Arc::clone(&registry_a), transport_a, Arc::clone(&mesh.view));
        let replicated = replicator
            .replicate_to_peers("llama3", &["node-b".to_string()])
            .await
            .unwrap();

        assert_eq!(replicated, 0);
        assert_eq!(registry_a.replica_count("llama3"), 1, "no unverified append");
    }

    #[tokio::test]
    async fn ensure_replication_targets_online_non_holders() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::new();
        let (registry_a, transport_a) = mesh.add_node("node-a", &dir);
        let (_registry_b, _tb) = mesh.add_node("node-b", &dir);
        let (_registry_c, _tc) = mesh.add_node("node-c", &dir);

        let data = b"weights".to_vec();
        let checksum = sha256_hex(&data);
        registry_a.store().write("llama3", &data).await.unwrap();
        registry_a
            .register("llama3", "/m", data.len() as u64, &checksum, "node-a")
            .await
            .unwrap();

        let replicator =
            Replicator::new(Arc::clone(&registry_a), transport_a, Arc::clone(&mesh.view));
        let replicated = replicator.ensure_replication("llama3").await.unwrap();

        // Factor is 2, one replica existed: exactly one new replica, on the
        // lexicographically first candidate.
        assert_eq!(replicated, 1);
        let meta = registry_a.get("llama3").unwrap();
        assert_eq!(meta.replicas, vec!["node-a", "node-b"]);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::new();
        let (registry_a, transport_a) = mesh.add_node("node-a", &dir);
        let replicator = Replicator::new(registry_a, transport_a, Arc::clone(&mesh.view));

        assert!(matches!(
            replicator.replicate_to_peers("ghost", &[]).await,
            Err(ServerError::NotFound(_))
        ));
    }
}
