//! Model replication wire payload.

use serde::{Deserialize, Serialize};

/// A model blob streamed to a peer missing it.
///
/// The receiver verifies `checksum` (hex SHA-256 of `data`) before
/// registering itself as a replica holder; a mismatch discards the transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatePayload {
    pub model: String,
    pub size_bytes: u64,
    pub checksum: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
