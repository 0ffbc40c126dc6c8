//! REST surface: CRUD over sessions/repos/environments/secrets, session
//! activation, history/event polling, and a health probe.
//!
//! Every response uses the envelope `{ data, error }` — success is always a
//! 2xx with `error: null`; failures map [`ApiError`] to a 4xx/5xx with
//! `data: null`. Activation is the only endpoint allowed to block (it waits
//! for the sandbox to report running); everything else is non-blocking and
//! defers to the Session/Repo/Storage layers for any slow work.

pub mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

/// Typed REST error. Maps to the envelope's `error` string and an HTTP
/// status; never carries a stack trace or internal detail to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({"data": null, "error": self.to_string()}))).into_response()
    }
}

/// Classifies an `anyhow::Error` surfaced from the Session Service by the
/// sentinel prefix its `bail!`/`context` calls use (`SESSION_NOT_FOUND`,
/// `SESSION_LIMIT`, `VALIDATION`), since those layers return plain
/// `anyhow::Result` rather than a typed error enum.
pub fn classify_session_error(err: anyhow::Error) -> ApiError {
    let message = err.to_string();
    if message.contains("SESSION_NOT_FOUND") {
        ApiError::NotFound(message)
    } else if message.contains("SESSION_LIMIT") || message.contains("VALIDATION") {
        ApiError::Validation(message)
    } else {
        ApiError::Internal(err)
    }
}

pub fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({"data": data, "error": null}))
}

pub async fn start_rest_server(host: &str, port: u16, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let router = build_router(ctx);

    info!(%addr, "REST surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/sessions", get(routes::sessions::list).post(routes::sessions::create))
        .route("/sessions/:id", get(routes::sessions::get).delete(routes::sessions::delete))
        .route("/sessions/:id/activate", post(routes::sessions::activate))
        .route("/sessions/:id/archive", post(routes::sessions::archive))
        .route("/sessions/:id/history", get(routes::sessions::history))
        .route("/sessions/:id/events", get(routes::sessions::events))
        .route("/repos", get(routes::repos::list).post(routes::repos::upsert))
        .route("/environments", get(routes::environments::list).post(routes::environments::create))
        .route("/secrets", post(routes::secrets::create))
        .route("/models", get(routes::models::list))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
