//! `GET /health` (spec §6 + SPEC_FULL §6 ambient additions).

use crate::models::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json as ResponseJson};

/// Health check endpoint.
///
/// Reports build metadata plus a best-effort, non-blocking reachability
/// check of the Session Store and Chunk Store backends.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, ResponseJson<HealthResponse>) {
    let session_store_reachable = state
        .orchestrator
        .store()
        .get("__health_check__")
        .await
        .is_ok();
    let chunk_store_reachable = state
        .orchestrator
        .chunk_store()
        .range("__health_check__", domain::model::StreamRole::Teacher, 1, 0)
        .await
        .is_ok();

    (
        StatusCode::OK,
        ResponseJson(HealthResponse {
            status: "ok".to_string(),
            version: option_env!("CARGO_PKG_VERSION").map(|v| v.to_string()),
            git_sha: option_env!("GIT_SHA").map(|v| v.to_string()),
            asr_realtime_enabled: state.config.asr.realtime_enabled,
            asr_mode: if state.config.asr.enabled { "realtime".to_string() } else { "disabled".to_string() },
            asr_model: state.config.asr.model.clone(),
            session_store_reachable,
            chunk_store_reachable,
        }),
    )
}
