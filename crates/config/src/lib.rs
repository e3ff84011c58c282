// Configuration Management
//
// This crate handles all configuration loading for the edge session core.
// It provides:
// - Configuration structs
// - Environment variable loading
// - Default configuration values
//
// This keeps configuration concerns separate from the session/domain logic.

use thiserror::Error;

pub mod types;

// Re-export all configuration types
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from environment: {0}")]
    EnvError(String),
}

fn env_var(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("missing required environment variable {key}"))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_var_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Attempts to load a `.env` file from the current directory first
    /// (ignored if absent), then reads every knob described in §10/§6 of
    /// the specification from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env().map_err(ConfigError::EnvError)
    }

    fn from_env() -> Result<Self, String> {
        Ok(Self {
            server: ServerConfig {
                host: env_var_or("HOST", "0.0.0.0"),
                port: env_var_num("PORT", 8080),
            },
            storage: StorageConfig {
                chunk_bucket: env_var("CHUNK_STORE_BUCKET")?,
                chunk_prefix: env_var_or("CHUNK_STORE_PREFIX", "sessions"),
                result_key_prefix: env_var_or("RESULT_KEY_PREFIX", "sessions"),
            },
            session_store: SessionStoreConfig {
                host: env_var_or("SESSION_DB_HOST", "localhost"),
                port: env_var_num("SESSION_DB_PORT", 5432),
                database: env_var_or("SESSION_DB_NAME", "edge_session_core"),
                username: env_var_or("SESSION_DB_USER", "postgres"),
                password: env_var_or("SESSION_DB_PASSWORD", ""),
                schema_version: env_var_num("SESSION_SCHEMA_VERSION", 1),
            },
            inference: InferenceConfig {
                primary_url: env_var("INFERENCE_BASE_URL_PRIMARY")?,
                secondary_url: env_var_opt("INFERENCE_BASE_URL_SECONDARY"),
                timeout_ms: env_var_num("INFERENCE_TIMEOUT_MS", 60_000),
                retry_max: env_var_num("INFERENCE_RETRY_MAX", 2),
                retry_backoff_ms: env_var_num("INFERENCE_RETRY_BACKOFF_MS", 180),
                circuit_open_ms: env_var_num("INFERENCE_CIRCUIT_OPEN_MS", 15_000),
                failover_enabled: env_var_bool("INFERENCE_FAILOVER_ENABLED", false),
                api_key: env_var_opt("INFERENCE_API_KEY"),
            },
            asr: AsrConfig {
                enabled: env_var_bool("ASR_ENABLED", true),
                model: env_var_or("ASR_MODEL", "paraformer-realtime-v2"),
                realtime_enabled: env_var_bool("ASR_REALTIME_ENABLED", true),
                upstream_url: env_var_or(
                    "ASR_UPSTREAM_URL",
                    "wss://dashscope.aliyuncs.com/api-ws/v1/inference",
                ),
                dashscope_api_key: env_var_opt("ALIYUN_DASHSCOPE_API_KEY"),
                replay_window_secs: env_var_num("ASR_REPLAY_WINDOW_SECS", 10),
                replay_hop_secs: env_var_num("ASR_REPLAY_HOP_SECS", 2),
                send_queue_cap: env_var_num("ASR_SEND_QUEUE_CAP", 64),
            },
            finalize: FinalizeConfig {
                v2_enabled: env_var_bool("FINALIZE_V2_ENABLED", true),
                drain_timeout_secs: env_var_num("FINALIZE_DRAIN_TIMEOUT_SECS", 30),
            },
            worker_api_key: env_var_or("WORKER_API_KEY", ""),
            logging: LoggingConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases share process env, so they run as one test to avoid
    // interference from the test harness's default parallelism.
    #[test]
    fn env_loading() {
        std::env::remove_var("CHUNK_STORE_BUCKET");
        std::env::remove_var("INFERENCE_BASE_URL_PRIMARY");
        let err = CoreConfig::from_env().unwrap_err();
        assert!(err.contains("CHUNK_STORE_BUCKET"));

        std::env::set_var("CHUNK_STORE_BUCKET", "test-bucket");
        std::env::set_var("INFERENCE_BASE_URL_PRIMARY", "https://primary.example.com");
        std::env::remove_var("INFERENCE_RETRY_MAX");
        let config = CoreConfig::from_env().expect("config should load");
        assert_eq!(config.inference.retry_max, 2);
        assert_eq!(config.inference.circuit_open_ms, 15_000);
        assert_eq!(config.asr.replay_window_secs, 10);
    }
}
