//! Integration tests for the control-plane HTTP surface, wired to
//! in-memory backends (spec §6) so they don't need a live Postgres/S3
//! instance. Grounded on the teacher's `tests/e2e_*` style of driving the
//! router end-to-end through `axum_test::TestServer`.

use api::routes::AppState;
use config::{
    AsrConfig, CoreConfig, FinalizeConfig, InferenceConfig, LoggingConfig, ServerConfig,
    SessionStoreConfig, StorageConfig,
};
use database::{InMemoryChunkStore, InMemorySessionStore};
use inference_providers::InferenceClient;
use serde_json::json;
use services::ingest::IngestGateway;
use services::orchestrator::SessionOrchestrator;
use std::sync::Arc;

fn test_config(worker_api_key: &str) -> CoreConfig {
    CoreConfig {
        server: ServerConfig::default(),
        storage: StorageConfig {
            chunk_bucket: "test-bucket".to_string(),
            chunk_prefix: "sessions".to_string(),
            result_key_prefix: "sessions".to_string(),
        },
        session_store: SessionStoreConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "core".to_string(),
            username: "core".to_string(),
            password: "core".to_string(),
            schema_version: 1,
        },
        inference: InferenceConfig {
            primary_url: "http://localhost:9000".to_string(),
            secondary_url: None,
            timeout_ms: 1000,
            retry_max: 1,
            retry_backoff_ms: 10,
            circuit_open_ms: 1000,
            failover_enabled: false,
            api_key: None,
        },
        asr: AsrConfig {
            enabled: true,
            model: "test-model".to_string(),
            realtime_enabled: true,
            upstream_url: "ws://localhost:9001".to_string(),
            dashscope_api_key: None,
            replay_window_secs: 10,
            replay_hop_secs: 2,
            send_queue_cap: 8,
        },
        finalize: FinalizeConfig { v2_enabled: false, drain_timeout_secs: 1 },
        worker_api_key: worker_api_key.to_string(),
        logging: LoggingConfig::default(),
    }
}

fn test_server(worker_api_key: &str) -> axum_test::TestServer {
    let config = Arc::new(test_config(worker_api_key));
    let store = Arc::new(InMemorySessionStore::new());
    let chunk_store = Arc::new(InMemoryChunkStore::new());
    let inference = Arc::new(InferenceClient::new(config.inference.clone()));

    let orchestrator = Arc::new(SessionOrchestrator::new(
        store,
        chunk_store,
        inference,
        config.clone(),
    ));
    let ingest = Arc::new(IngestGateway::new(orchestrator.clone()));
    let state = AppState { orchestrator, ingest, config };

    let app = api::build_router(state);
    axum_test::TestServer::new(app).expect("failed to build test server")
}

#[tokio::test]
async fn health_check_reports_ok_and_reachable_backends() {
    let server = test_server("secret");
    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["session_store_reachable"], true);
    assert_eq!(body["chunk_store_reachable"], true);
}

#[tokio::test]
async fn config_round_trips_through_state() {
    let server = test_server("secret");
    let session_id = "sess-1";

    let response = server
        .post(&format!("/v1/sessions/{session_id}/config"))
        .json(&json!({
            "mode": "1v1",
            "roster": [{"name": "Alice"}, {"name": "Bob"}],
            "interviewer_name": "Carol",
        }))
        .await;
    response.assert_status_ok();

    let response = server.get(&format!("/v1/sessions/{session_id}/state")).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["session"]["config"]["interviewer_name"], "Carol");
    assert_eq!(body["session"]["config"]["roster"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_session_starts_with_no_events_or_utterances() {
    let server = test_server("secret");
    let session_id = "sess-empty";

    let response = server.get(&format!("/v1/sessions/{session_id}/events")).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["events"].as_array().unwrap().is_empty());

    let response = server
        .get(&format!("/v1/sessions/{session_id}/utterances"))
        .add_query_param("view", "merged")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["utterances"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let server = test_server("secret");
    let session_id = "sess-finalize";

    let first = server.post(&format!("/v1/sessions/{session_id}/finalize")).await;
    first.assert_status_ok();
    let first_body: serde_json::Value = first.json();
    let first_stage = first_body["stage"].clone();

    let second = server.post(&format!("/v1/sessions/{session_id}/finalize")).await;
    second.assert_status_ok();
    let second_body: serde_json::Value = second.json();
    assert_eq!(first_stage, second_body["stage"]);
}

#[tokio::test]
async fn cluster_map_rejects_unknown_cluster() {
    let server = test_server("secret");
    let session_id = "sess-cluster";

    let response = server
        .post(&format!("/v1/sessions/{session_id}/cluster-map"))
        .json(&json!({"cluster_id": "does-not-exist", "name": "Alice", "locked": false}))
        .await;

    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error_type"], "update_rejected");
}

#[tokio::test]
async fn admin_endpoint_rejects_missing_worker_key() {
    let server = test_server("secret");
    let session_id = "sess-admin";

    let response = server
        .post(&format!("/v1/sessions/{session_id}/asr-reset"))
        .json(&json!({}))
        .await;

    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_endpoint_accepts_matching_worker_key() {
    let server = test_server("secret");
    let session_id = "sess-admin-ok";

    let response = server
        .post(&format!("/v1/sessions/{session_id}/asr-reset"))
        .add_header("x-worker-api-key", "secret")
        .json(&json!({}))
        .await;

    response.assert_status_ok();
}

#[tokio::test]
async fn enrollment_start_then_stop_clears_active_state() {
    let server = test_server("secret");
    let session_id = "sess-enroll";

    let response = server
        .post(&format!("/v1/sessions/{session_id}/enrollment/start"))
        .json(&json!({"participant_name": "Alice"}))
        .await;
    response.assert_status_ok();

    let state = server.get(&format!("/v1/sessions/{session_id}/enrollment/state")).await;
    state.assert_status_ok();
    let body: serde_json::Value = state.json();
    assert_eq!(body["state"]["active"], true);
    assert_eq!(body["state"]["active_participant"], "Alice");

    let response = server
        .post(&format!("/v1/sessions/{session_id}/enrollment/stop"))
        .json(&json!({"participant_name": "Alice"}))
        .await;
    response.assert_status_ok();

    let state = server.get(&format!("/v1/sessions/{session_id}/enrollment/state")).await;
    state.assert_status_ok();
    let body: serde_json::Value = state.json();
    assert_eq!(body["state"]["active"], false);
}

#[tokio::test]
async fn audio_ws_upgrade_requires_api_key_query_param() {
    let server = test_server("secret");
    let response = server.get("/v1/audio/ws/sess-ws/teacher").await;
    response.assert_status_bad_request();
}
