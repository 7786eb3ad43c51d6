use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use jervis_core::git::{project_repo_dir, Git};
use jervis_core::plan::AnswerRenderer;
use jervis_core::types::{ModelType, PlanStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CompletionsBody {
    pub prompt: String,
}

#[derive(Deserialize)]
pub(crate) struct ChatMessageBody {
    #[allow(dead_code)]
    pub role: String,
    pub content: String,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionsBody {
    pub model: String,
    pub messages: Vec<ChatMessageBody>,
}

#[derive(Deserialize)]
pub(crate) struct EmbeddingsBody {
    pub input: String,
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CreateProjectBody {
    pub name: String,
    pub slug: String,
}

#[derive(Deserialize)]
pub(crate) struct IndexEventsQuery {
    pub project_id: i64,
}

#[derive(Deserialize)]
pub(crate) struct KbProgressBody {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub kind: String,
    pub step: Option<String>,
    pub message: Option<String>,
}

// ── Shared helpers ────────────────────────────────────────────────────────

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── LLM gateway surface (§6) ──────────────────────────────────────────────

/// `POST /completions` — OpenAI-compatible text completion routed to C9.
pub(crate) async fn completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionsBody>,
) -> Result<Json<Value>, StatusCode> {
    let mut mapping = std::collections::HashMap::new();
    mapping.insert("code".to_string(), body.prompt);

    let schema = json!({
        "type": "object",
        "required": ["text"],
        "properties": { "text": { "type": "string" } }
    });

    let result = state
        .llm
        .call_llm("completion", &schema, false, &mapping, None, false)
        .await
        .map_err(internal)?;
    let text = result.get("text").and_then(Value::as_str).unwrap_or_default();

    Ok(Json(json!({
        "object": "text_completion",
        "choices": [{ "text": text, "index": 0, "finish_reason": "stop" }],
    })))
}

/// `POST /chat/completions` — builds a single-step plan from the last user
/// message, runs it to completion, and finalizes it inline so the answer is
/// available before the response is sent.
pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatCompletionsBody>,
) -> Result<Json<Value>, StatusCode> {
    let question = body
        .messages
        .last()
        .map(|m| m.content.clone())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let (project_id, client_id) = state
        .db
        .get_project_by_slug(&body.model)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let context_id = state.db.insert_context(client_id, Some(project_id)).map_err(internal)?;
    let plan_id = state
        .db
        .insert_plan(context_id, &question, &question, "en")
        .map_err(internal)?;
    state
        .db
        .insert_plan_step(plan_id, 1, "RAG_SEARCH", &question)
        .map_err(internal)?;

    state.plan_executor.run_plan(plan_id).await.map_err(internal)?;

    let plan = state.db.get_plan(plan_id).map_err(internal)?.ok_or(StatusCode::NOT_FOUND)?;
    let answer = if plan.status.is_terminal() {
        match state.answer_renderer.render_final_answer(&plan).await {
            Ok(answer) => {
                state
                    .db
                    .update_plan_status(plan_id, PlanStatus::Finalized, Some(&answer))
                    .map_err(internal)?;
                answer
            }
            Err(e) => {
                tracing::warn!(plan_id, error = %e, "finalization failed inline, plan left for the background sweep");
                plan.final_answer.clone().unwrap_or_else(|| "closed by user".to_string())
            }
        }
    } else {
        "closed by user".to_string()
    };

    Ok(Json(json!({
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": { "role": "assistant", "content": answer },
        }],
    })))
}

/// `POST /embeddings` — computes text embeddings via C9.
pub(crate) async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmbeddingsBody>,
) -> Result<Json<Value>, StatusCode> {
    let model_type = match body.model.as_deref() {
        Some("code") => ModelType::Code,
        _ => ModelType::Text,
    };
    let vector = state.embeddings.embed(model_type, &body.input).await.map_err(internal)?;
    let model_name = state.embeddings.model_name(model_type);

    Ok(Json(json!({
        "model": model_name,
        "data": [{ "index": 0, "embedding": vector }],
    })))
}

// ── Indexing (§6, C6) ──────────────────────────────────────────────────────

/// `POST /api/projects/{id}/index/reindex` — starts a pipeline run in the
/// background and returns immediately; progress is observable on
/// `GET /api/index/events`.
pub(crate) async fn reindex_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let client_id = state
        .db
        .project_client_id(project_id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let repo_dir = project_repo_dir(&state.config.data_dir, project_id);
    let git = Git::new(&repo_dir);
    let commit_hash = match git.default_branch().and_then(|branch| git.rev_parse_head(&branch)) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::warn!(project_id, error = %e, "reindex requested but no local working copy is available yet");
            String::new()
        }
    };

    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(e) = pipeline.run(client_id, project_id, &commit_hash).await {
            tracing::error!(project_id, error = %e, "indexing pipeline run failed");
        }
    });

    Ok(Json(json!({ "status": "started" })))
}

// ── Client / Project CRUD (§6) ────────────────────────────────────────────

/// `POST /api/clients/{id}/projects` — creates (or updates, by slug) a
/// project under an existing client.
pub(crate) async fn create_project(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<i64>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !is_valid_slug(&body.slug) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let project_id = state
        .db
        .upsert_project(client_id, &body.name, &body.slug)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": project_id }))))
}

// ── Knowledge-base push endpoint (§6) ─────────────────────────────────────

/// `POST /api/internal/kb-progress` — optional push endpoint for the
/// external knowledge-base service's own progress events; folded into the
/// same log stream `GET /api/logs/stream` serves.
pub(crate) async fn kb_progress(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KbProgressBody>,
) -> StatusCode {
    let data = json!({
        "ts": chrono::Utc::now().timestamp(),
        "level": "info",
        "message": body.message.unwrap_or_default(),
        "category": "gateway",
        "step": body.step,
    })
    .to_string();
    let _ = state.log_tx.send(data);
    StatusCode::OK
}

// ── SSE (ambient, §6) ──────────────────────────────────────────────────────

/// `GET /api/logs/stream` — replays the ring-buffer history then streams
/// live C14 log lines.
pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

/// `GET /api/index/events` — per-project SSE stream of C6 `PipelineEvent`s:
/// history replay (bounded, via `IndexEventStreamManager`) then the live
/// tail of whatever run is currently in flight for that project.
pub(crate) async fn sse_index_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IndexEventsQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let project_id = q.project_id;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (history, mut live_rx) = state.index_events.subscribe(project_id).await;
        for event in history {
            if tx.send(serde_json::to_string(&event).unwrap_or_default()).is_err() {
                return;
            }
        }
        loop {
            match live_rx.recv().await {
                Ok(event) => {
                    if tx.send(serde_json::to_string(&event).unwrap_or_default()).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
