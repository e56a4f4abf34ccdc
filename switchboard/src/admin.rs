//! Admin surface: gateway health, registry status, and manual restarts.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::http::AppState;

/// GET /admin/health
///
/// `healthy` only when every enabled backend is ready; `degraded` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let status = if state.registry.healthy() {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({"status": status})).into_response()
}

/// GET /admin/status
///
/// Registry snapshot: per-backend health and tool counts, shadowed catalog
/// entries, and live session count.
pub async fn status(State(state): State<AppState>) -> Response {
    let snapshot = state.registry.current_snapshot();
    Json(json!({
        "backends": state.registry.statuses(),
        "tools": snapshot.tool_count(),
        "shadowed": snapshot.shadowed(),
        "sessions": state.sessions.count(),
    }))
    .into_response()
}

/// POST /admin/backends/{id}/restart
pub async fn restart_backend(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
) -> Response {
    match state.registry.restart(&backend_id) {
        Ok(()) => Json(json!({"restarting": backend_id})).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
