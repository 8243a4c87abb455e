//! Ollama-compatible inference endpoints.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use infermesh_core::types::{ChatMessage, DistributedTask, TaskInput, TaskType};

use crate::error::ServerError;
use crate::util::now_ms;

use super::AppState;

fn build_task(state: &AppState, task_type: TaskType, model: String, input: TaskInput) -> DistributedTask {
    DistributedTask::new(
        task_type,
        model,
        input,
        now_ms(),
        state.config.orchestrator.task_timeout_ms,
    )
}

/// Renders aggregated partition results as response text.
fn render_text(aggregated: &serde_json::Value) -> String {
    aggregated["results"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .map(|r| {
                    if let Some(text) = r.get("text").and_then(|t| t.as_str()) {
                        text.to_string()
                    } else if let Some(text) = r.as_str() {
                        text.to_string()
                    } else {
                        r.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// /api/generate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: u64,
    pub response: String,
    pub done: bool,
    pub total_duration_ms: u64,
}

pub async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServerError> {
    if request.model.is_empty() {
        return Err(ServerError::Input("model is required".to_string()));
    }
    let _guard = state.shutdown.in_flight_guard();
    let started = now_ms();

    let task = build_task(
        &state,
        TaskType::Inference,
        request.model.clone(),
        TaskInput::Prompt {
            text: request.prompt,
        },
    );
    let aggregated = state.orchestrator.execute(task).await?;

    Ok(Json(GenerateResponse {
        model: request.model,
        created_at: started,
        response: render_text(&aggregated),
        done: true,
        total_duration_ms: now_ms().saturating_sub(started),
    }))
}

// ---------------------------------------------------------------------------
// /api/chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: u64,
    pub message: ChatMessage,
    pub done: bool,
}

pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ServerError> {
    if request.model.is_empty() {
        return Err(ServerError::Input("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(ServerError::Input("messages must not be empty".to_string()));
    }
    let _guard = state.shutdown.in_flight_guard();
    let started = now_ms();

    let task = build_task(
        &state,
        TaskType::Inference,
        request.model.clone(),
        TaskInput::Messages {
            messages: request.messages,
        },
    );
    let aggregated = state.orchestrator.execute(task).await?;

    Ok(Json(ChatResponse {
        model: request.model,
        created_at: started,
        message: ChatMessage {
            role: "assistant".to_string(),
            content: render_text(&aggregated),
        },
        done: true,
    }))
}

// ---------------------------------------------------------------------------
// /api/embed
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbedInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: EmbedInput,
}

pub async fn embed_handler(
    State(state): State<AppState>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if request.model.is_empty() {
        return Err(ServerError::Input("model is required".to_string()));
    }
    let _guard = state.shutdown.in_flight_guard();

    let items: Vec<serde_json::Value> = match request.input {
        EmbedInput::One(text) => vec![json!(text)],
        EmbedInput::Many(texts) => texts.into_iter().map(|t| json!(t)).collect(),
    };
    let task = build_task(
        &state,
        TaskType::Embedding,
        request.model.clone(),
        TaskInput::Batch { items },
    );
    let aggregated = state.orchestrator.execute(task).await?;

    Ok(Json(json!({
        "model": request.model,
        "embeddings": aggregated["results"],
    })))
}
