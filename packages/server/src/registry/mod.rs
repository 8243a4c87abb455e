//! Model registry and replication.
//!
//! The registry tracks registered models and their replica sets; the
//! replicator streams blobs to peers until each model meets its
//! replication factor. Admission waits (`wait_for_replicas`) let the pull
//! API optionally block until the quorum invariant holds.

pub mod registry;
pub mod replication;

pub use registry::{
    read_blob, sha256_hex, ModelRegistry, ModelStore, ADMISSION_POLL_INTERVAL, MODEL_KEY_PREFIX,
};
pub use replication::Replicator;
