//! Server error taxonomy and HTTP status mapping.
//!
//! Transport and subtask errors are recovered locally (retry, circuit
//! break, alternative node); task-level failures surface to the caller as
//! 5xx with a stable error code; cluster-level conditions (e.g. the
//! replica invariant not met within the admission deadline) are non-errors
//! and only logged.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced across the API or internal channels.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// Malformed request or config.
    #[error("invalid input: {0}")]
    Input(String),

    /// Unknown model or node.
    #[error("not found: {0}")]
    NotFound(String),

    /// The load balancer found no candidate after constraint filtering.
    #[error("no eligible nodes: {0}")]
    NoEligibleNodes(String),

    /// No partition strategy accepted the task.
    #[error("partition failure: {0}")]
    PartitionFailure(String),

    /// A subtask failed after exhausting its retry policy.
    #[error("subtask failure: {0}")]
    SubtaskFailure(String),

    /// Per-subtask, per-recovery-step, or per-operation deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient peer communication failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unrecoverable startup failure; the process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServerError {
    /// Stable machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Input(_) => "invalid_input",
            ServerError::NotFound(_) => "not_found",
            ServerError::NoEligibleNodes(_) => "no_eligible_nodes",
            ServerError::PartitionFailure(_) => "partition_failure",
            ServerError::SubtaskFailure(_) => "subtask_failure",
            ServerError::Timeout(_) => "timeout",
            ServerError::Transport(_) => "transport_error",
            ServerError::Fatal(_) => "fatal",
        }
    }

    /// HTTP status this error maps to at the API boundary.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Input(_) | ServerError::PartitionFailure(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NoEligibleNodes(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServerError::SubtaskFailure(_)
            | ServerError::Transport(_)
            | ServerError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` for errors a caller may retry against the same cluster.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerError::NoEligibleNodes(_)
                | ServerError::Timeout(_)
                | ServerError::Transport(_)
        )
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (self.status(), body).into_response()
    }
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
