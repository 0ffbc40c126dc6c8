//! `/sessions` REST routes: CRUD plus the blocking activation endpoint and
//! the history/events polling endpoints used by clients that aren't
//! attached to the RPC Bridge.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};

use crate::{
    rest::{classify_session_error, envelope, ApiError},
    session::CreateSessionOptions,
    AppContext,
};

/// Activation blocks waiting for the sandbox to come up; this bounds how
/// long a caller can be held before the relay gives up and reports an error
/// rather than hanging the HTTP connection indefinitely.
const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let sessions = ctx.session_manager.list().await.map_err(classify_session_error)?;
    Ok(envelope(sessions))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub mode: String,
    pub repo_full_name: Option<String>,
    pub branch: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub repo_clone_url: Option<String>,
    pub environment_id: Option<String>,
}

fn default_provider() -> String {
    "mock".to_string()
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let opts = CreateSessionOptions {
        mode: body.mode,
        repo_full_name: body.repo_full_name,
        branch: body.branch,
        provider: body.provider,
        model_provider: body.model_provider,
        model_id: body.model_id,
        system_prompt: body.system_prompt,
        repo_clone_url: body.repo_clone_url,
        environment_id: body.environment_id,
    };
    let session = ctx
        .session_manager
        .create(ctx.config.max_sessions, opts)
        .await
        .map_err(classify_session_error)?;
    Ok(envelope(session))
}

pub async fn get(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let session = ctx.session_manager.get(&id).await.map_err(classify_session_error)?;
    Ok(envelope(session))
}

pub async fn delete(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    ctx.session_manager.delete(&id).await.map_err(classify_session_error)?;
    Ok(envelope(Value::Null))
}

/// Logical deletion: terminates the sandbox and moves the session to
/// `archived`, but — unlike `DELETE /sessions/:id` — keeps the row and its
/// journaled events for later inspection.
pub async fn archive(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    ctx.session_manager.archive(&id).await.map_err(classify_session_error)?;
    Ok(envelope(Value::Null))
}

pub async fn activate(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    match tokio::time::timeout(ACTIVATE_TIMEOUT, ctx.session_manager.activate(&id)).await {
        Ok(result) => {
            let last_seq = result.map_err(classify_session_error)?;
            Ok(envelope(serde_json::json!({"lastSeq": last_seq})))
        }
        Err(_) => Err(ApiError::Internal(anyhow::anyhow!(
            "activation of session {id} timed out after {}s",
            ACTIVATE_TIMEOUT.as_secs()
        ))),
    }
}

pub async fn history(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    // Confirms the session exists before returning an (always well-formed)
    // event list, so a typo'd id 404s instead of silently returning [].
    ctx.session_manager.get(&id).await.map_err(classify_session_error)?;
    let events = ctx.journal.get_recent(&id, 200).await.map_err(ApiError::Internal)?;
    Ok(envelope(events))
}

#[derive(Deserialize, Default)]
pub struct EventsQuery {
    #[serde(rename = "sinceSeq", default)]
    pub since_seq: Option<i64>,
}

pub async fn events(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    ctx.session_manager.get(&id).await.map_err(classify_session_error)?;
    let since_seq = query.since_seq.unwrap_or(0);
    let events = ctx.journal.get_after_seq(&id, since_seq).await.map_err(ApiError::Internal)?;
    let last_seq = ctx.journal.get_max_seq(&id).await.map_err(ApiError::Internal)?;
    Ok(envelope(serde_json::json!({"events": events, "lastSeq": last_seq})))
}
