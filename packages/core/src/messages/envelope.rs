//! Peer message envelope.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::NodeId;

use super::cluster::{AnnouncePayload, HeartbeatPayload, PingPayload, PongPayload};
use super::replication::ReplicatePayload;
use super::task::{
    BroadcastPayload, CancelSubtaskPayload, DispatchSubtaskPayload, SubtaskResultPayload,
};

/// Top-level peer protocol message.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    // -- Membership --------------------------------------------------------
    Announce(AnnouncePayload),
    Heartbeat(HeartbeatPayload),
    Ping(PingPayload),
    Pong(PongPayload),

    // -- Tasks -------------------------------------------------------------
    DispatchSubtask(DispatchSubtaskPayload),
    SubtaskResult(SubtaskResultPayload),
    CancelSubtask(CancelSubtaskPayload),
    Broadcast(BroadcastPayload),

    // -- Models ------------------------------------------------------------
    Replicate(ReplicatePayload),
}

/// Wire envelope wrapping every peer message.
///
/// `timestamp_ms` is monotonic per sender; receivers drop envelopes whose
/// timestamp is not newer than the last one applied from the same sender
/// and message class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender: NodeId,
    pub timestamp_ms: u64,
    pub message: PeerMessage,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: NodeId, timestamp_ms: u64, message: PeerMessage) -> Self {
        Self {
            sender,
            timestamp_ms,
            message,
        }
    }

    /// Serializes to named MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Encode(e.to_string()))
    }

    /// Deserializes from MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_msgpack() {
        let env = Envelope::new(
            "node-1".to_string(),
            1_700_000_000_000,
            PeerMessage::Ping(PingPayload { nonce: 42 }),
        );

        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode(&[0xFF, 0x00, 0x13]).is_err());
    }
}
