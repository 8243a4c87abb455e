//! In-memory replicated key-value log.
//!
//! Single-writer map with broadcast apply notifications. Stands in for the
//! consensus-backed store in tests and single-node deployments.

use dashmap::DashMap;
use tokio::sync::broadcast;

use async_trait::async_trait;

use crate::error::ServerError;

use super::traits::{KvEntry, KvLog};

pub struct InMemoryKvLog {
    entries: DashMap<String, Vec<u8>>,
    applied: broadcast::Sender<KvEntry>,
}

impl Default for InMemoryKvLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvLog {
    #[must_use]
    pub fn new() -> Self {
        let (applied, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            applied,
        }
    }
}

#[async_trait]
impl KvLog for InMemoryKvLog {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ServerError> {
        self.entries.insert(key.to_string(), value.clone());
        // No subscribers is fine; the send result is intentionally ignored.
        let _ = self.applied.send(KvEntry {
            key: key.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ServerError> {
        self.entries.remove(key);
        let _ = self.applied.send(KvEntry {
            key: key.to_string(),
            value: None,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServerError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ServerError> {
        let mut result: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    fn subscribe(&self) -> broadcast::Receiver<KvEntry> {
        self.applied.subscribe()
    }
}
