use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    rest::{envelope, ApiError},
    AppContext,
};

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let environments = ctx.storage.list_environments().await.map_err(ApiError::Internal)?;
    Ok(envelope(environments))
}

#[derive(Deserialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub sandbox_type: String,
    pub image: Option<String>,
    pub remote_worker_url: Option<String>,
    pub secret_id: Option<String>,
    #[serde(default = "default_resource_tier")]
    pub resource_tier: String,
}

fn default_resource_tier() -> String {
    "standard".to_string()
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateEnvironmentRequest>,
) -> Result<Json<Value>, ApiError> {
    let environment = ctx
        .storage
        .create_environment(
            &body.name,
            &body.sandbox_type,
            body.image.as_deref(),
            body.remote_worker_url.as_deref(),
            body.secret_id.as_deref(),
            &body.resource_tier,
        )
        .await
        .map_err(ApiError::Internal)?;
    Ok(envelope(environment))
}
