//! Peer transport, replicated KV log, and inference runtime seams.
//!
//! Contracts live in [`traits`]; [`local`] and [`kv`] provide the
//! in-process implementations used by tests and single-node deployments.

pub mod dedup;
pub mod kv;
pub mod local;
pub mod traits;

pub use dedup::DedupFilter;
pub use kv::InMemoryKvLog;
pub use local::{EchoRuntime, LocalTransport, LocalTransportHub};
pub use traits::{InferenceRuntime, KvEntry, KvLog, PeerHandler, PeerTransport};
