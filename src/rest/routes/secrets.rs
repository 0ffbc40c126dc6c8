//! `/secrets` — write-only. A created secret's id can be referenced by an
//! environment; its plaintext is never returned over REST, only decrypted
//! internally when a sandbox is created or resumed.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    rest::{envelope, ApiError},
    AppContext,
};

const ALLOWED_KINDS: &[&str] = &["aiProvider", "envVar", "sandboxProvider"];

#[derive(Deserialize)]
pub struct CreateSecretRequest {
    pub kind: String,
    /// Binds the ciphertext to its intended use (e.g. an environment id) so
    /// decrypting it under a different context fails closed.
    pub aad: String,
    pub plaintext: String,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSecretRequest>,
) -> Result<Json<Value>, ApiError> {
    if !ALLOWED_KINDS.contains(&body.kind.as_str()) {
        return Err(ApiError::Validation(format!(
            "VALIDATION: secret kind must be one of {ALLOWED_KINDS:?}, got {}",
            body.kind
        )));
    }
    let id = ctx
        .secrets
        .put(&body.kind, &body.aad, &body.plaintext)
        .await
        .map_err(ApiError::Internal)?;
    Ok(envelope(serde_json::json!({"id": id})))
}
