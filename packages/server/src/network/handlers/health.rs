//! Health, liveness, readiness, and version handlers.
//!
//! These expose server health for orchestrators (Kubernetes, load
//! balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::network::shutdown::HealthState;

use super::{AppState, SERVER_VERSION};

/// Returns detailed health information as JSON.
///
/// Always returns 200; the `state` field in the body says whether the
/// server is actually healthy, which lets monitoring distinguish "up but
/// draining" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "node_id": state.view.local_id(),
        "known_nodes": state.view.len(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Kubernetes liveness probe -- always 200.
///
/// Only checks that the process responds; a failing liveness probe
/// triggers a restart, so it must not depend on downstream state.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- 200 when ready, 503 otherwise.
///
/// 503 during startup, while draining, and after stop, which removes the
/// node from ingress rotation.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// `GET /api/v1/version`
pub async fn version_handler() -> Json<serde_json::Value> {
    Json(json!({ "version": SERVER_VERSION }))
}
