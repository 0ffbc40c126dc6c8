use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    rest::{envelope, ApiError},
    AppContext,
};

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let repos = ctx.repo_registry.list().await.map_err(ApiError::Internal)?;
    Ok(envelope(repos))
}

#[derive(Deserialize)]
pub struct UpsertRepoRequest {
    pub full_name: String,
    pub owner: String,
    #[serde(default)]
    pub private: bool,
    pub default_branch: String,
    pub clone_url: String,
    pub description: Option<String>,
}

pub async fn upsert(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<UpsertRepoRequest>,
) -> Result<Json<Value>, ApiError> {
    let repo = ctx
        .repo_registry
        .upsert(
            &body.full_name,
            &body.owner,
            body.private,
            &body.default_branch,
            &body.clone_url,
            body.description.as_deref(),
        )
        .await
        .map_err(ApiError::Internal)?;
    Ok(envelope(repo))
}
