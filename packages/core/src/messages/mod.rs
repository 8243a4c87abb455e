//! Node-to-node wire messages.
//!
//! All peer traffic rides a single [`Envelope`] carrying a monotonic
//! timestamp for deduplication. Payloads are grouped by concern: cluster
//! membership ([`cluster`]), task dispatch ([`task`]), and model
//! replication ([`replication`]). Envelopes serialize with
//! `rmp_serde::to_vec_named()`.

pub mod cluster;
pub mod envelope;
pub mod replication;
pub mod task;

pub use cluster::{AnnounceAction, AnnouncePayload, HeartbeatPayload, PingPayload, PongPayload};
pub use envelope::{Envelope, PeerMessage};
pub use replication::ReplicatePayload;
pub use task::{
    BroadcastPayload, CancelSubtaskPayload, DispatchSubtaskPayload, SubtaskResultPayload,
};
