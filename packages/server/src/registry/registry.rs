//! Model registry: registered models, replica sets, and admission waits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use infermesh_core::messages::ReplicatePayload;
use infermesh_core::types::{ModelMeta, NodeId};

use crate::error::ServerError;
use crate::transport::{KvEntry, KvLog};
use crate::util::now_ms;

/// Key prefix for model metadata in the replicated log.
pub const MODEL_KEY_PREFIX: &str = "models/";

/// Replica-count poll interval for admission waits.
pub const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ---------------------------------------------------------------------------
// ModelStore
// ---------------------------------------------------------------------------

/// Local blob storage under the configured models directory.
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    #[must_use]
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }

    /// Path a model's blob is stored at on this node.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        // Model names may contain `/` (registry-style names); flatten them.
        self.root.join(name.replace('/', "_"))
    }

    /// Writes a blob, creating the storage directory on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] when the filesystem rejects the write.
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ServerError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ServerError::Fatal(format!("create {}: {e}", self.root.display())))?;
        let path = self.path_for(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ServerError::Fatal(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Reads a blob back.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] when the blob is missing.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.path_for(name);
        tokio::fs::read(&path)
            .await
            .map_err(|_| ServerError::NotFound(format!("model blob {}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// ModelRegistry
// ---------------------------------------------------------------------------

/// Registered models with their replica sets.
///
/// The replicated key-value log publishes the authoritative replica list;
/// the local table is a read-mostly cache refreshed on log apply. Replica
/// lists only grow until an explicit delete.
pub struct ModelRegistry {
    models: DashMap<String, ModelMeta>,
    kv: Arc<dyn KvLog>,
    store: ModelStore,
    local_id: NodeId,
    replication_factor: u32,
}

impl ModelRegistry {
    pub fn new(
        kv: Arc<dyn KvLog>,
        storage_path: &str,
        local_id: &str,
        replication_factor: u32,
    ) -> Self {
        Self {
            models: DashMap::new(),
            kv,
            store: ModelStore::new(storage_path),
            local_id: local_id.to_string(),
            replication_factor,
        }
    }

    #[must_use]
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Warms the local cache from the replicated log at startup.
    ///
    /// # Errors
    ///
    /// Propagates log read failures.
    pub async fn load_from_log(&self) -> Result<(), ServerError> {
        for (key, value) in self.kv.scan_prefix(MODEL_KEY_PREFIX).await? {
            match serde_json::from_slice::<ModelMeta>(&value) {
                Ok(meta) => {
                    self.models.insert(meta.name.clone(), meta);
                }
                Err(e) => warn!(%key, "skipping undecodable model entry: {e}"),
            }
        }
        Ok(())
    }

    async fn publish(&self, meta: &ModelMeta) -> Result<(), ServerError> {
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| ServerError::Input(format!("encode model meta: {e}")))?;
        self.kv
            .put(&format!("{MODEL_KEY_PREFIX}{}", meta.name), bytes)
            .await
    }

    /// Registers a model, or adds `holding_node` to an existing model's
    /// replica list. Idempotent with set semantics; the authoritative list
    /// is published on the log.
    ///
    /// # Errors
    ///
    /// Propagates log write failures.
    pub async fn register(
        &self,
        name: &str,
        path: &str,
        size_bytes: u64,
        checksum: &str,
        holding_node: &str,
    ) -> Result<ModelMeta, ServerError> {
        let now = now_ms();
        let meta = {
            let mut entry = self
                .models
                .entry(name.to_string())
                .or_insert_with(|| ModelMeta {
                    name: name.to_string(),
                    path: path.to_string(),
                    size_bytes,
                    checksum: checksum.to_string(),
                    replicas: Vec::new(),
                    replication_factor: self.replication_factor,
                    access_count: 0,
                    last_accessed_ms: now,
                    popularity: 0.0,
                });
            if entry.add_replica(holding_node) {
                info!(model = name, node = holding_node, "replica registered");
            }
            entry.clone()
        };
        self.publish(&meta).await?;
        Ok(meta)
    }

    /// Appends a verified replica holder and republishes.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] for unknown models.
    pub async fn add_replica(&self, name: &str, node_id: &str) -> Result<(), ServerError> {
        let meta = {
            let mut entry = self
                .models
                .get_mut(name)
                .ok_or_else(|| ServerError::NotFound(format!("model {name}")))?;
            entry.add_replica(node_id);
            entry.clone()
        };
        self.publish(&meta).await
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ModelMeta> {
        self.models.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<ModelMeta> {
        let mut models: Vec<ModelMeta> =
            self.models.iter().map(|entry| entry.value().clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    #[must_use]
    pub fn replica_count(&self, name: &str) -> usize {
        self.models.get(name).map_or(0, |m| m.replicas.len())
    }

    /// Models whose replica count is below their declared factor.
    #[must_use]
    pub fn under_replicated(&self) -> Vec<ModelMeta> {
        self.models
            .iter()
            .filter(|entry| {
                (entry.value().replicas.len() as u32) < entry.value().replication_factor
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes a model from the registry and the log. In-flight subtasks
    /// referencing it are not quiesced; they surface failures through the
    /// normal retry path.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] for unknown models.
    pub async fn remove(&self, name: &str) -> Result<(), ServerError> {
        if self.models.remove(name).is_none() {
            return Err(ServerError::NotFound(format!("model {name}")));
        }
        self.kv.delete(&format!("{MODEL_KEY_PREFIX}{name}")).await?;
        info!(model = name, "model removed");
        Ok(())
    }

    /// Blocks until the model has at least `min` replicas or the deadline
    /// elapses, polling every 500 ms.
    ///
    /// Returns `Ok(true)` when the invariant was met, `Ok(false)` on
    /// deadline expiry -- expiry is a non-error by the admission contract;
    /// replication continues asynchronously.
    pub async fn wait_for_replicas(&self, name: &str, min: usize, deadline: Duration) -> bool {
        let wait = async {
            loop {
                if self.replica_count(name) >= min {
                    return;
                }
                tokio::time::sleep(ADMISSION_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    model = name,
                    min, "admission deadline elapsed; replication continues in background"
                );
                false
            }
        }
    }

    /// Bumps access accounting and refreshes the popularity score.
    pub fn record_access(&self, name: &str) {
        if let Some(mut entry) = self.models.get_mut(name) {
            let now = now_ms();
            entry.access_count += 1;
            entry.last_accessed_ms = now;
            entry.popularity = popularity_score(entry.access_count, 0);
        }
    }

    /// Recomputes popularity from current wall time, aging idle models.
    pub fn refresh_popularity(&self) {
        let now = now_ms();
        for mut entry in self.models.iter_mut() {
            let idle_ms = now.saturating_sub(entry.last_accessed_ms);
            entry.popularity = popularity_score(entry.access_count, idle_ms);
        }
    }

    /// Applies a log entry produced by another node, refreshing the cache.
    pub fn apply_kv_entry(&self, entry: &KvEntry) {
        let Some(name) = entry.key.strip_prefix(MODEL_KEY_PREFIX) else {
            return;
        };
        match &entry.value {
            Some(bytes) => match serde_json::from_slice::<ModelMeta>(bytes) {
                Ok(meta) => {
                    self.models.insert(name.to_string(), meta);
                }
                Err(e) => warn!(model = name, "undecodable model apply: {e}"),
            },
            None => {
                self.models.remove(name);
            }
        }
    }

    /// Ingests a replicated blob: verifies the checksum, stores the blob,
    /// and registers this node as a holder. A checksum mismatch discards
    /// the transfer without touching the replica list.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Input`] on checksum mismatch; propagates
    /// storage and log failures.
    pub async fn receive_replica(&self, payload: ReplicatePayload) -> Result<(), ServerError> {
        let actual = sha256_hex(&payload.data);
        if actual != payload.checksum {
            warn!(model = %payload.model, "replica checksum mismatch, discarding");
            metrics::counter!("registry_replica_checksum_mismatches").increment(1);
            return Err(ServerError::Input(format!(
                "checksum mismatch for {}: expected {}, got {actual}",
                payload.model, payload.checksum
            )));
        }

        let path = self.store.write(&payload.model, &payload.data).await?;
        let local_id = self.local_id.clone();
        self.register(
            &payload.model,
            &path.to_string_lossy(),
            payload.size_bytes,
            &payload.checksum,
            &local_id,
        )
        .await?;
        metrics::counter!("registry_replicas_received").increment(1);
        Ok(())
    }

    /// Names of models this node holds, for heartbeat advertisement.
    #[must_use]
    pub fn local_model_names(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|entry| entry.value().replicas.iter().any(|n| n == &self.local_id))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Popularity in `[0, 1]`: saturates with access count and decays with
/// idle time (half-life of one day).
#[allow(clippy::cast_precision_loss)]
#[must_use]
fn popularity_score(access_count: u64, idle_ms: u64) -> f64 {
    const DAY_MS: f64 = 86_400_000.0;
    let saturation = 1.0 - (-(access_count as f64) / 20.0).exp();
    let decay = 0.5_f64.powf(idle_ms as f64 / DAY_MS);
    (saturation * decay).clamp(0.0, 1.0)
}

/// Reads a blob from an arbitrary path (used when registering operator
/// supplied models that live outside the store).
///
/// # Errors
///
/// Returns [`ServerError::NotFound`] when the path cannot be read.
pub async fn read_blob(path: &Path) -> Result<Vec<u8>, ServerError> {
    tokio::fs::read(path)
        .await
        .map_err(|_| ServerError::NotFound(format!("model blob {}", path.display())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
