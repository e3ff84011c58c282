use serde::{Deserialize, Serialize};

/// Top level configuration for the edge session core.
///
/// Loaded once at process startup (see [`crate::CoreConfig::load`]) and
/// threaded through constructors; nothing downstream reads the
/// environment directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub session_store: SessionStoreConfig,
    pub inference: InferenceConfig,
    pub asr: AsrConfig,
    pub finalize: FinalizeConfig,
    pub worker_api_key: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Blob storage knobs for the Chunk Store (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub chunk_bucket: String,
    #[serde(default = "default_chunk_prefix")]
    pub chunk_prefix: String,
    #[serde(default = "default_result_prefix")]
    pub result_key_prefix: String,
}

fn default_chunk_prefix() -> String {
    "sessions".to_string()
}

fn default_result_prefix() -> String {
    "sessions".to_string()
}

/// Session State Store knobs (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Current in-code schema version; sessions stored with a lower
    /// version are migrated forward on load.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

/// Inference Client knobs (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub primary_url: String,
    pub secondary_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_circuit_open_ms")]
    pub circuit_open_ms: u64,
    #[serde(default)]
    pub failover_enabled: bool,
    pub api_key: Option<String>,
}

fn default_timeout_ms() -> u64 {
    60_000
}
fn default_retry_max() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    180
}
fn default_circuit_open_ms() -> u64 {
    15_000
}

/// ASR Driver knobs (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_asr_model")]
    pub model: String,
    #[serde(default)]
    pub realtime_enabled: bool,
    pub upstream_url: String,
    pub dashscope_api_key: Option<String>,
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: u64,
    #[serde(default = "default_replay_hop_secs")]
    pub replay_hop_secs: u64,
    #[serde(default = "default_send_queue_cap")]
    pub send_queue_cap: usize,
}

fn default_asr_model() -> String {
    "paraformer-realtime-v2".to_string()
}
fn default_replay_window_secs() -> u64 {
    10
}
fn default_replay_hop_secs() -> u64 {
    2
}
fn default_send_queue_cap() -> usize {
    64
}

/// Finalizer knobs (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    #[serde(default)]
    pub v2_enabled: bool,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
