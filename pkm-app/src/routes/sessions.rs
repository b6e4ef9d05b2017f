use crate::server::AppState;
use crate::session::LockAttempt;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{id}", axum::routing::delete(delete_session))
        .route("/api/v1/sessions/{id}/history", get(get_history))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[tracing::instrument(level = "debug", skip_all, fields(session_id = %id))]
async fn get_history(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.sessions.try_lock_existing(&id) {
        LockAttempt::Missing => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        ),
        LockAttempt::Busy => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "busy",
                "error": "a turn is running for this session",
            })),
        ),
        LockAttempt::Locked(session) => {
            let stats = state
                .agent
                .assembler()
                .budgeter()
                .stats(&session.history, state.history_token_budget);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ok",
                    "session_id": session.id,
                    "created_at": session.created_at,
                    "last_active": session.last_active,
                    "turns": session.turns,
                    "usage_totals": session.usage_totals,
                    "stats": stats,
                    "messages": session.history,
                })),
            )
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(session_id = %id))]
async fn delete_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.sessions.delete(&id).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}
