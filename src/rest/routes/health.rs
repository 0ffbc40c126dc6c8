use axum::extract::State;
use serde_json::Value;
use std::sync::Arc;

use crate::{rest::envelope, AppContext};

pub async fn health(State(ctx): State<Arc<AppContext>>) -> axum::Json<Value> {
    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let store_ok = ctx.storage.get_setting("__health_probe").await.is_ok();
    envelope(serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}
