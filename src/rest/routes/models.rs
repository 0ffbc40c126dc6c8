//! `/models` — the set of provider/model pairs a client may pass to
//! `session.create`/`set_model`. The relay treats the agent process as an
//! opaque black box (spec.md's Non-goals exclude AI provider integration
//! entirely), so this is a static catalog for client UI population, not a
//! live query against any provider's API.

use axum::Json;
use serde_json::{json, Value};

use crate::rest::envelope;

pub async fn list() -> Json<Value> {
    envelope(json!([
        {"provider": "anthropic", "id": "claude-opus-4"},
        {"provider": "anthropic", "id": "claude-sonnet-4"},
        {"provider": "openai", "id": "gpt-5"},
    ]))
}
