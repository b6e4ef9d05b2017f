use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let chunk_store = match state.chunk_store.as_ref() {
        None => serde_json::json!({ "configured": false }),
        Some(store) => match store.embedded_chunk_count().await {
            Ok(count) => serde_json::json!({ "configured": true, "embedded_chunks": count }),
            Err(e) => serde_json::json!({ "configured": true, "error": e.to_string() }),
        },
    };
    let ready = chunk_store.get("error").is_none();

    Json(serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "checked_at": Utc::now(),
        "started_at": state.started_at,
        "model": state.agent.model_name(),
        "tools": state.agent.tool_names(),
        "sessions": state.sessions.count(),
        "checks": { "chunk_store": chunk_store },
    }))
}
