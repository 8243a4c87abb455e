//! Model lifecycle endpoints (Ollama-compatible shapes).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::registry::{read_blob, sha256_hex};

use super::AppState;

fn spawn_replication(state: &AppState, name: &str) {
    let replicator = Arc::clone(&state.replicator);
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = replicator.ensure_replication(&name).await {
            warn!(model = %name, "background replication failed: {e}");
        }
    });
}

// ---------------------------------------------------------------------------
// GET /api/tags
// ---------------------------------------------------------------------------

pub async fn tags_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|m| {
            json!({
                "name": m.name,
                "size": m.size_bytes,
                "digest": m.checksum,
                "modified_at": m.last_accessed_ms,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

// ---------------------------------------------------------------------------
// POST /api/pull
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub name: String,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Pulls a model onto this node.
///
/// With blocking admission enabled the handler waits (up to the deadline)
/// for the replica invariant before responding; deadline expiry is NOT an
/// error -- the response is still success and replication continues in the
/// background.
pub async fn pull_handler(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let Some(meta) = state.registry.get(&request.name) else {
        return Err(ServerError::NotFound(format!("model {}", request.name)));
    };
    let _guard = state.shutdown.in_flight_guard();

    spawn_replication(&state, &request.name);

    let models_config = &state.config.models;
    if models_config.admission_blocking {
        let met = state
            .registry
            .wait_for_replicas(
                &request.name,
                models_config.replication_factor as usize,
                Duration::from_millis(models_config.admission_deadline_ms),
            )
            .await;
        if !met {
            info!(
                model = %request.name,
                "admission deadline elapsed; replication continues asynchronously"
            );
        }
    }

    Ok(Json(json!({
        "status": "success",
        "digest": meta.checksum,
        "replicas": state.registry.replica_count(&request.name),
    })))
}

// ---------------------------------------------------------------------------
// POST /api/create
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    /// Filesystem path of the model blob on this node.
    pub path: String,
}

pub async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if request.name.is_empty() {
        return Err(ServerError::Input("name is required".to_string()));
    }
    let _guard = state.shutdown.in_flight_guard();

    let blob = read_blob(&PathBuf::from(&request.path)).await?;
    let checksum = sha256_hex(&blob);
    let stored = state.registry.store().write(&request.name, &blob).await?;

    let local_id = state.view.local_id().to_string();
    let meta = state
        .registry
        .register(
            &request.name,
            &stored.to_string_lossy(),
            blob.len() as u64,
            &checksum,
            &local_id,
        )
        .await?;
    state.manager.set_local_models(state.registry.local_model_names());
    spawn_replication(&state, &request.name);

    Ok(Json(json!({
        "status": "success",
        "digest": meta.checksum,
    })))
}

// ---------------------------------------------------------------------------
// POST /api/push
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub name: String,
}

pub async fn push_handler(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let _guard = state.shutdown.in_flight_guard();
    let peers: Vec<String> = state
        .view
        .available()
        .into_iter()
        .map(|n| n.id)
        .filter(|id| id != state.view.local_id())
        .collect();
    let replicated = state.replicator.replicate_to_peers(&request.name, &peers).await?;
    Ok(Json(json!({
        "status": "success",
        "replicated_to": replicated,
    })))
}

// ---------------------------------------------------------------------------
// POST /api/copy
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    pub source: String,
    pub destination: String,
}

pub async fn copy_handler(
    State(state): State<AppState>,
    Json(request): Json<CopyRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let _guard = state.shutdown.in_flight_guard();
    let source = state
        .registry
        .get(&request.source)
        .ok_or_else(|| ServerError::NotFound(format!("model {}", request.source)))?;

    let blob = state.registry.store().read(&request.source).await?;
    let stored = state.registry.store().write(&request.destination, &blob).await?;
    let local_id = state.view.local_id().to_string();
    state
        .registry
        .register(
            &request.destination,
            &stored.to_string_lossy(),
            source.size_bytes,
            &source.checksum,
            &local_id,
        )
        .await?;
    state.manager.set_local_models(state.registry.local_model_names());

    Ok(Json(json!({ "status": "success" })))
}

// ---------------------------------------------------------------------------
// DELETE /api/delete
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub name: String,
}

/// Removes a model. In-flight subtasks referencing it are not quiesced;
/// they surface failures through the normal retry path.
pub async fn delete_handler(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let _guard = state.shutdown.in_flight_guard();
    state.registry.remove(&request.name).await?;
    state.manager.set_local_models(state.registry.local_model_names());
    Ok(Json(json!({ "status": "success" })))
}

// ---------------------------------------------------------------------------
// POST /api/show
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ShowRequest {
    pub name: String,
}

pub async fn show_handler(
    State(state): State<AppState>,
    Json(request): Json<ShowRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let meta = state
        .registry
        .get(&request.name)
        .ok_or_else(|| ServerError::NotFound(format!("model {}", request.name)))?;
    Ok(Json(json!({
        "name": meta.name,
        "size": meta.size_bytes,
        "digest": meta.checksum,
        "replicas": meta.replicas,
        "replication_factor": meta.replication_factor,
        "access_count": meta.access_count,
        "popularity": meta.popularity,
    })))
}
