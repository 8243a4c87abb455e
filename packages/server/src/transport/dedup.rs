//! Envelope deduplication by per-sender monotonic timestamp.

use dashmap::DashMap;

use infermesh_core::types::NodeId;

/// Tracks the newest envelope timestamp seen from each sender and rejects
/// replays and reordered duplicates.
///
/// Timestamps are monotonic per sender by protocol contract; equal
/// timestamps are treated as duplicates.
#[derive(Debug, Default)]
pub struct DedupFilter {
    last_seen: DashMap<NodeId, u64>,
}

impl DedupFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the envelope should be processed, updating the
    /// sender's high-water mark.
    pub fn admit(&self, sender: &str, timestamp_ms: u64) -> bool {
        let mut admitted = false;
        self.last_seen
            .entry(sender.to_string())
            .and_modify(|last| {
                if timestamp_ms > *last {
                    *last = timestamp_ms;
                    admitted = true;
                }
            })
            .or_insert_with(|| {
                admitted = true;
                timestamp_ms
            });
        admitted
    }

    /// Drops tracking state for a departed sender.
    pub fn forget(&self, sender: &str) {
        self.last_seen.remove(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_envelope_is_admitted() {
        let filter = DedupFilter::new();
        assert!(filter.admit("node-1", 100));
    }

    #[test]
    fn newer_timestamps_admitted_older_rejected() {
        let filter = DedupFilter::new();
        assert!(filter.admit("node-1", 100));
        assert!(filter.admit("node-1", 101));
        assert!(!filter.admit("node-1", 101), "duplicate must be rejected");
        assert!(!filter.admit("node-1", 50), "replay must be rejected");
    }

    #[test]
    fn senders_are_tracked_independently() {
        let filter = DedupFilter::new();
        assert!(filter.admit("node-1", 100));
        assert!(filter.admit("node-2", 50));
        assert!(!filter.admit("node-1", 100));
    }

    #[test]
    fn forget_resets_high_water_mark() {
        let filter = DedupFilter::new();
        assert!(filter.admit("node-1", 100));
        filter.forget("node-1");
        assert!(filter.admit("node-1", 10), "fresh join restarts numbering");
    }
}
