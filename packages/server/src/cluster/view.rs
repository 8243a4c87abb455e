//! Shared cluster view.
//!
//! `ClusterView` is the single table of known nodes, consumed by the
//! scheduler, partition engine, orchestrator, and HTTP surface. Lifting it
//! out of the cluster manager breaks the manager/balancer/orchestrator
//! reference cycle: everyone holds the view, nobody holds each other.

use dashmap::DashMap;
use tokio::sync::mpsc;

use infermesh_core::messages::HeartbeatPayload;
use infermesh_core::types::{NodeId, NodeInfo, NodeStatus};

use crate::util::ewma;

use super::types::ClusterEvent;

/// Concurrent node table with reactive change notifications.
///
/// Readers copy records out under `DashMap` shard locks; writers never hold
/// a lock across I/O.
pub struct ClusterView {
    nodes: DashMap<NodeId, NodeInfo>,
    local_id: NodeId,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

impl ClusterView {
    /// Creates an empty view and returns the change event receiver.
    pub fn new(local_id: &str) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                nodes: DashMap::new(),
                local_id: local_id.to_string(),
                events,
            },
            rx,
        )
    }

    /// This node's id.
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn emit(&self, event: ClusterEvent) {
        // Receiver may be gone during shutdown; that is fine.
        let _ = self.events.send(event);
    }

    /// Inserts or replaces a full node record.
    pub fn upsert(&self, info: NodeInfo) {
        let id = info.id.clone();
        let existed = self.nodes.insert(id.clone(), info).is_some();
        if existed {
            self.emit(ClusterEvent::NodeUpdated(id));
        } else {
            self.emit(ClusterEvent::NodeJoined(id));
        }
    }

    /// Overwrites only the owner-mutable fields (capacity, usage, models),
    /// as announcement `update` semantics require. Unknown nodes are
    /// ignored.
    pub fn apply_update(&self, info: &NodeInfo) {
        if let Some(mut entry) = self.nodes.get_mut(&info.id) {
            entry.capacity = info.capacity.clone();
            entry.usage = info.usage.clone();
            entry.models = info.models.clone();
            entry.capabilities = info.capabilities.clone();
            entry.last_seen_ms = entry.last_seen_ms.max(info.last_seen_ms);
            drop(entry);
            self.emit(ClusterEvent::NodeUpdated(info.id.clone()));
        }
    }

    /// Removes a node record (leave announcement or operator action).
    pub fn remove(&self, node_id: &str) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            self.emit(ClusterEvent::NodeLeft(node_id.to_string()));
        }
        removed
    }

    /// Returns a clone of one node's record.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All known nodes, unordered.
    #[must_use]
    pub fn all(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Nodes eligible for scheduling (status `Online`).
    #[must_use]
    pub fn available(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().status.is_schedulable())
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sets a node's status. Returns `true` if the status changed.
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if entry.status == status {
            return false;
        }
        entry.status = status;
        drop(entry);
        self.emit(ClusterEvent::StatusChanged {
            node_id: node_id.to_string(),
            status,
        });
        true
    }

    /// Applies a heartbeat with last-writer-wins semantics keyed by the
    /// sender timestamp. A heartbeat older than the stored `last_seen` is
    /// dropped. Unknown senders get a minimal record created -- the
    /// recovery path after a discovery miss.
    ///
    /// Returns `true` if the heartbeat was applied.
    pub fn apply_heartbeat(&self, hb: &HeartbeatPayload, sender_address: &str) -> bool {
        match self.nodes.get_mut(&hb.node_id) {
            Some(mut entry) => {
                if hb.timestamp_ms < entry.last_seen_ms {
                    return false;
                }
                entry.capacity = hb.capacity.clone();
                entry.usage = hb.usage.clone();
                entry.models = hb.models.clone();
                entry.last_seen_ms = hb.timestamp_ms;
                drop(entry);
                self.emit(ClusterEvent::NodeUpdated(hb.node_id.clone()));
                true
            }
            None => {
                let mut info = NodeInfo::stub(
                    hb.node_id.clone(),
                    sender_address.to_string(),
                    hb.timestamp_ms,
                );
                info.capacity = hb.capacity.clone();
                info.usage = hb.usage.clone();
                info.models = hb.models.clone();
                self.upsert(info);
                true
            }
        }
    }

    /// Folds a measured round-trip latency into the node's smoothed figure.
    pub fn record_latency(&self, node_id: &str, latency_ms: f64) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.latency_ms = Some(ewma(entry.latency_ms, latency_ms, 0.3));
        }
    }

    /// Refreshes `last_seen` without touching capacity or usage.
    pub fn touch(&self, node_id: &str, now_ms: u64) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use infermesh_core::types::{NodeCapacity, NodeUsage};

    use super::*;

    fn make_node(id: &str) -> NodeInfo {
        NodeInfo::stub(id.to_string(), format!("10.0.0.{id}:9090"), 1000)
    }

    fn make_heartbeat(id: &str, ts: u64) -> HeartbeatPayload {
        HeartbeatPayload {
            node_id: id.to_string(),
            timestamp_ms: ts,
            capacity: NodeCapacity {
                cpu_cores: 8,
                ..NodeCapacity::default()
            },
            usage: NodeUsage {
                cpu_percent: 0.5,
                ..NodeUsage::default()
            },
            models: vec!["llama3".to_string()],
        }
    }

    #[test]
    fn upsert_emits_joined_then_updated() {
        let (view, mut rx) = ClusterView::new("local");
        view.upsert(make_node("a"));
        view.upsert(make_node("a"));

        assert_eq!(rx.try_recv().unwrap(), ClusterEvent::NodeJoined("a".to_string()));
        assert_eq!(rx.try_recv().unwrap(), ClusterEvent::NodeUpdated("a".to_string()));
    }

    #[test]
    fn available_filters_by_schedulable_status() {
        let (view, _rx) = ClusterView::new("local");
        view.upsert(make_node("a"));
        view.upsert(make_node("b"));
        view.set_status("b", NodeStatus::Draining);

        let available = view.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "a");
    }

    #[test]
    fn set_status_reports_change_only_once() {
        let (view, mut rx) = ClusterView::new("local");
        view.upsert(make_node("a"));
        let _ = rx.try_recv();

        assert!(view.set_status("a", NodeStatus::Offline));
        assert!(!view.set_status("a", NodeStatus::Offline));
        assert!(!view.set_status("missing", NodeStatus::Offline));

        assert_eq!(
            rx.try_recv().unwrap(),
            ClusterEvent::StatusChanged {
                node_id: "a".to_string(),
                status: NodeStatus::Offline,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn heartbeat_creates_minimal_record_for_unknown_node() {
        let (view, _rx) = ClusterView::new("local");
        assert!(view.apply_heartbeat(&make_heartbeat("ghost", 2000), "10.0.0.9:9090"));

        let node = view.get("ghost").unwrap();
        assert_eq!(node.capacity.cpu_cores, 8);
        assert_eq!(node.models, vec!["llama3"]);
        assert_eq!(node.last_seen_ms, 2000);
    }

    #[test]
    fn stale_heartbeat_is_dropped() {
        let (view, _rx) = ClusterView::new("local");
        assert!(view.apply_heartbeat(&make_heartbeat("a", 2000), "addr"));
        assert!(!view.apply_heartbeat(&make_heartbeat("a", 1500), "addr"));

        let node = view.get("a").unwrap();
        assert_eq!(node.last_seen_ms, 2000);
    }

    #[test]
    fn apply_update_only_touches_owner_fields() {
        let (view, _rx) = ClusterView::new("local");
        view.upsert(make_node("a"));
        view.set_status("a", NodeStatus::Draining);

        let mut update = make_node("a");
        update.status = NodeStatus::Online; // sender's status is never trusted
        update.capacity.cpu_cores = 64;
        view.apply_update(&update);

        let node = view.get("a").unwrap();
        assert_eq!(node.capacity.cpu_cores, 64);
        assert_eq!(node.status, NodeStatus::Draining, "status is receiver-owned");
    }

    #[test]
    fn apply_update_ignores_unknown_node() {
        let (view, _rx) = ClusterView::new("local");
        view.apply_update(&make_node("ghost"));
        assert!(view.get("ghost").is_none());
    }

    #[test]
    fn record_latency_smooths() {
        let (view, _rx) = ClusterView::new("local");
        view.upsert(make_node("a"));

        view.record_latency("a", 10.0);
        assert!((view.get("a").unwrap().latency_ms.unwrap() - 10.0).abs() < 1e-9);

        view.record_latency("a", 20.0);
        let smoothed = view.get("a").unwrap().latency_ms.unwrap();
        assert!(smoothed > 10.0 && smoothed < 20.0);
    }

    #[test]
    fn remove_is_idempotent() {
        let (view, _rx) = ClusterView::new("local");
        view.upsert(make_node("a"));
        assert!(view.remove("a"));
        assert!(!view.remove("a"));
    }
}
