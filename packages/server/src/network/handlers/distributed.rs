//! Cluster observability endpoints under `/api/distributed`.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::error::ServerError;

use super::{AppState, SERVER_VERSION};

/// `GET /api/distributed/status`
pub async fn distributed_status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let peers: Vec<String> = state
        .view
        .all()
        .into_iter()
        .map(|n| n.id)
        .filter(|id| id != state.view.local_id())
        .collect();
    Json(json!({
        "node_id": state.view.local_id(),
        "connected_peers": peers.len(),
        "peers": peers,
        "models_loaded": state.registry.local_model_names().len(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": SERVER_VERSION,
    }))
}

/// `GET /api/distributed/nodes`
pub async fn distributed_nodes_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut nodes = state.view.all();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let nodes: Vec<serde_json::Value> = nodes
        .into_iter()
        .map(|n| {
            let health = state.health_checker.check_result(&n.id);
            json!({
                "id": n.id,
                "address": n.address,
                "status": n.status,
                "latency_ms": n.latency_ms,
                "models": n.models,
                "last_seen_ms": n.last_seen_ms,
                "health": health,
            })
        })
        .collect();
    Json(json!({ "nodes": nodes }))
}

/// `GET /api/distributed/models`
pub async fn distributed_models_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|m| {
            json!({
                "name": m.name,
                "size": m.size_bytes,
                "replica_count": m.replicas.len(),
                "locations": m.replicas,
                "replication_factor": m.replication_factor,
                "popularity": m.popularity,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

/// `GET /api/distributed/models/{name}/replicas`
pub async fn model_replicas_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let meta = state
        .registry
        .get(&name)
        .ok_or_else(|| ServerError::NotFound(format!("model {name}")))?;
    Ok(Json(json!({
        "model": meta.name,
        "replicas": meta.replicas,
        "replication_factor": meta.replication_factor,
    })))
}

/// `GET /api/distributed/metrics`
pub async fn distributed_metrics_handler(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    Json(json!({
        "orchestrator": state.orchestrator.counters(),
        "balancer": state.balancer.metrics(),
        "partition": state.partition_engine.metrics(),
        "breakers": state.orchestrator.breakers().snapshot(),
    }))
}

/// `GET /api/distributed/requests`
pub async fn distributed_requests_handler(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    Json(json!({ "requests": state.orchestrator.active_digest() }))
}

/// `GET /api/distributed/replication/status`
pub async fn replication_status_handler(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let models = state.registry.list();
    let under: Vec<serde_json::Value> = state
        .registry
        .under_replicated()
        .into_iter()
        .map(|m| {
            json!({
                "name": m.name,
                "replica_count": m.replicas.len(),
                "replication_factor": m.replication_factor,
            })
        })
        .collect();
    Json(json!({
        "models_total": models.len(),
        "under_replicated": under,
        "inflight_transfers": state.replicator.inflight_count(),
    }))
}
