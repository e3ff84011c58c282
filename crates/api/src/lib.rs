//! HTTP/WebSocket surface for the edge session core (spec §6).

pub mod conversions;
pub mod middleware;
pub mod models;
pub mod openapi;
pub mod routes;

pub use services::now_ms;

use axum::{
    middleware::from_fn_with_state,
    response::Html,
    routing::{get, post},
    Router,
};
use routes::{audio_ws, control, health, AppState};
use utoipa::OpenApi;

/// Assemble the full router from a ready [`AppState`] (spec §6). Shared by
/// `main.rs` and the integration tests so there is exactly one definition
/// of what's mounted where.
pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/v1/sessions/{session_id}/asr-run", post(control::asr_run))
        .route("/v1/sessions/{session_id}/asr-reset", post(control::asr_reset))
        .layer(from_fn_with_state(state.config.clone(), middleware::worker_key_middleware))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::health_check))
        .route("/v1/audio/ws/{session_id}/{stream_role}", get(audio_ws::audio_ws_handler))
        .route("/v1/sessions/{session_id}/config", post(control::set_config))
        .route("/v1/sessions/{session_id}/state", get(control::get_state))
        .route("/v1/sessions/{session_id}/events", get(control::get_events))
        .route("/v1/sessions/{session_id}/utterances", get(control::get_utterances))
        .route("/v1/sessions/{session_id}/finalize", post(control::finalize_session))
        .route("/v1/sessions/{session_id}/enrollment/start", post(control::start_enrollment))
        .route("/v1/sessions/{session_id}/enrollment/stop", post(control::stop_enrollment))
        .route("/v1/sessions/{session_id}/enrollment/state", get(control::get_enrollment_state))
        .route("/v1/sessions/{session_id}/cluster-map", post(control::set_cluster_map))
        .route("/v1/sessions/{session_id}/unresolved-clusters", get(control::get_unresolved_clusters))
        .with_state(state)
        .merge(admin_routes)
        .merge(build_openapi_routes())
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Serve the generated OpenAPI document plus a minimal static viewer,
/// mirroring the teacher's `build_openapi_routes`/`swagger_ui_handler`
/// split rather than pulling in a dedicated Swagger-UI crate.
pub fn build_openapi_routes() -> Router {
    Router::new()
        .route("/docs", get(docs_handler))
        .route("/api-docs/openapi.json", get(|| async { axum::Json(openapi::ApiDoc::openapi()) }))
}

async fn docs_handler() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html lang="en">
<head>
    <meta charset="utf-8" />
    <title>Edge Session Core API Documentation</title>
</head>
<body>
    <script id="api-reference" type="application/json" data-url="/api-docs/openapi.json"></script>
    <script src="https://cdn.jsdelivr.net/npm/@scalar/api-reference"></script>
</body>
</html>"#,
    )
}
