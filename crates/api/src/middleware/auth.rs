//! Authentication (spec §6, §4.3 ambient additions).
//!
//! Two distinct checks, both constant-time against the configured secret,
//! grounded on the teacher's `middleware::auth` extraction style but
//! adapted from session cookies to the simpler shared-secret scheme this
//! system uses:
//! - the ingest WebSocket's `api_key` query parameter (checked inline by
//!   `routes::audio_ws` before the upgrade, not as a tower layer — axum's
//!   `WebSocketUpgrade` needs to own the request to answer with the
//!   correct close code on failure);
//! - the `WORKER_API_KEY` header gate on the admin-only replay endpoints,
//!   applied as an `axum::middleware::from_fn_with_state` layer.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use config::CoreConfig;
use inference_providers::auth::constant_time_eq;
use std::sync::Arc;
use tracing::warn;

pub const WORKER_API_KEY_HEADER: &str = "x-worker-api-key";

/// Checked by `routes::audio_ws` directly against the `api_key` query
/// parameter before the WebSocket upgrade (spec §6: "close WebSocket with
/// code 1008" on failure — the layer can't express that close code, so
/// this lives as a plain function rather than a `from_fn` middleware).
pub fn check_worker_api_key(config: &CoreConfig, presented: &str) -> bool {
    constant_time_eq(config.worker_api_key.as_bytes(), presented.as_bytes())
}

/// Tower middleware gating the admin-only `asr-run`/`asr-reset` endpoints
/// behind the `X-Worker-Api-Key` header (spec §6 "admin-only replay
/// tools").
pub async fn worker_key_middleware(
    State(config): State<Arc<CoreConfig>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = headers
        .get(WORKER_API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !check_worker_api_key(&config, presented) {
        warn!(path = %request.uri().path(), "rejected admin request: worker api key mismatch");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(key: &str) -> CoreConfig {
        CoreConfig {
            server: config::ServerConfig::default(),
            storage: config::StorageConfig {
                chunk_bucket: "b".to_string(),
                chunk_prefix: "sessions".to_string(),
                result_key_prefix: "sessions".to_string(),
            },
            session_store: config::SessionStoreConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "core".to_string(),
                username: "core".to_string(),
                password: "core".to_string(),
                schema_version: 1,
            },
            inference: config::InferenceConfig {
                primary_url: "http://localhost:9000".to_string(),
                secondary_url: None,
                timeout_ms: 1000,
                retry_max: 1,
                retry_backoff_ms: 10,
                circuit_open_ms: 1000,
                failover_enabled: false,
                api_key: None,
            },
            asr: config::AsrConfig {
                enabled: true,
                model: "test-model".to_string(),
                realtime_enabled: true,
                upstream_url: "ws://localhost:9001".to_string(),
                dashscope_api_key: None,
                replay_window_secs: 10,
                replay_hop_secs: 2,
                send_queue_cap: 8,
            },
            finalize: config::FinalizeConfig {
                v2_enabled: false,
                drain_timeout_secs: 1,
            },
            worker_api_key: key.to_string(),
            logging: config::LoggingConfig::default(),
        }
    }

    #[test]
    fn matching_key_is_accepted() {
        let config = test_config("secret");
        assert!(check_worker_api_key(&config, "secret"));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let config = test_config("secret");
        assert!(!check_worker_api_key(&config, "wrong"));
    }

    #[test]
    fn empty_presented_key_is_rejected() {
        let config = test_config("secret");
        assert!(!check_worker_api_key(&config, ""));
    }
}
