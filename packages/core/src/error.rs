//! Core error type for wire and algorithm failures.

use thiserror::Error;

/// Errors surfaced by the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// MessagePack serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// MessagePack deserialization failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Allocation inputs were inconsistent (e.g. no capacity scores, or
    /// min/max bounds that cannot fit the batch).
    #[error("invalid allocation input: {0}")]
    InvalidAllocation(String),
}
