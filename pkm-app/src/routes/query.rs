use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    session_id: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/query", post(post_query))
}

/// Model failures end the turn with 502; the session is left as it was and the same
/// session id can be retried.
#[tracing::instrument(level = "info", skip_all)]
async fn post_query(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": "query must not be empty" })),
        );
    }
    let requested = req.session_id.clone();
    match state.answer(req.session_id, &req.query).await {
        Ok((session_id, reply)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "session_id": session_id,
                "response": reply.text,
                "stop": reply.stop,
                "iterations": reply.iterations,
                "tool_calls": reply.tool_calls,
                "tool_errors": reply.tool_errors,
                "retrieved_chunks": reply.retrieved_chunks,
                "history_over_budget": reply.history_over_budget,
                "usage": reply.usage,
                "elapsed_ms": reply.elapsed_ms,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "query turn failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "status": "error",
                    "session_id": requested,
                    "error": format!("The assistant could not answer: {e}. Your session is unchanged; try again."),
                })),
            )
        }
    }
}
