//! Inference Client (spec §4.3): failover + circuit-breaker HTTP client
//! fronting the model-inference RPC endpoints.
//!
//! Built the way the teacher's `vllm::VLlmProvider` configures its
//! `reqwest::Client` (explicit connect/read timeouts, builder pattern);
//! the circuit map is a `Mutex<HashMap<Endpoint, CircuitState>>` shared
//! process-wide via `Arc`, mirroring the shared mutable state the
//! teacher's `InferenceProviderPool` keeps for its model mapping
//! (SPEC_FULL §4.3).

use crate::auth::constant_time_eq;
use crate::models::*;
use config::InferenceConfig;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("request to {0} timed out")]
    Timeout(&'static str),
    #[error("upstream {0} returned HTTP {1}")]
    Http(&'static str, u16),
    #[error("upstream unavailable for {0} (circuit open, no failover)")]
    UpstreamUnavailable(&'static str),
    #[error("network error calling {0}: {1}")]
    Network(&'static str, String),
    #[error("failed to (de)serialize payload for {0}: {1}")]
    Serialization(&'static str, String),
}

/// The eight RPC endpoints the Inference Client fronts (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ExtractEmbedding,
    Score,
    Resolve,
    Enroll,
    AnalysisEvents,
    AnalysisReport,
    AnalysisSynthesize,
    AnalysisRegenerateClaim,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Endpoint::ExtractEmbedding => "extract_embedding",
            Endpoint::Score => "score",
            Endpoint::Resolve => "resolve",
            Endpoint::Enroll => "enroll",
            Endpoint::AnalysisEvents => "analysis/events",
            Endpoint::AnalysisReport => "analysis/report",
            Endpoint::AnalysisSynthesize => "analysis/synthesize",
            Endpoint::AnalysisRegenerateClaim => "analysis/regenerate-claim",
        }
    }
}

/// Per-endpoint circuit breaker state (spec §4.3).
///
/// `open_since` records when the circuit tripped; the circuit is
/// considered open for exactly `circuit_open_ms` from that instant, after
/// which the next call is a fresh attempt against the primary (P7
/// "circuit liveness"). A successful primary call resets the state.
#[derive(Debug, Clone, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_since: Option<Instant>,
}

impl CircuitState {
    fn is_open(&self, circuit_open_ms: u64) -> bool {
        match self.open_since {
            Some(t) => t.elapsed() < Duration::from_millis(circuit_open_ms),
            None => false,
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.open_since = Some(Instant::now());
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_since = None;
    }
}

/// Failover + circuit breaker HTTP client for the Inference service
/// (spec §4.3). Cheap to clone: the `reqwest::Client` and circuit map are
/// both internally `Arc`-shared.
#[derive(Clone)]
pub struct InferenceClient {
    http: Client,
    config: InferenceConfig,
    circuits: std::sync::Arc<Mutex<HashMap<Endpoint, CircuitState>>>,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("failed to build inference HTTP client");

        Self {
            http,
            config,
            circuits: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn auth_header_ok(&self, presented: &str) -> bool {
        match &self.config.api_key {
            Some(expected) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            None => true,
        }
    }

    fn circuit_open(&self, endpoint: Endpoint) -> bool {
        let circuits = self.circuits.lock().expect("circuit mutex poisoned");
        circuits
            .get(&endpoint)
            .map(|s| s.is_open(self.config.circuit_open_ms))
            .unwrap_or(false)
    }

    fn note_failure(&self, endpoint: Endpoint) {
        let mut circuits = self.circuits.lock().expect("circuit mutex poisoned");
        circuits.entry(endpoint).or_default().record_failure();
    }

    fn note_success(&self, endpoint: Endpoint) {
        let mut circuits = self.circuits.lock().expect("circuit mutex poisoned");
        circuits.entry(endpoint).or_default().record_success();
    }

    fn url_for(&self, base: &str, endpoint: Endpoint) -> String {
        format!("{}/{}", base.trim_end_matches('/'), endpoint.path())
    }

    /// Attempt `retry_max + 1` tries against `base_url`, sleeping
    /// `retry_backoff_ms` between attempts (spec §4.3 step 1).
    async fn attempt<Req, Resp>(
        &self,
        base_url: &str,
        endpoint: Endpoint,
        body: &Req,
    ) -> Result<Resp, InferenceError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.url_for(base_url, endpoint);
        let mut last_err = None;

        for attempt in 0..=self.config.retry_max {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
            }

            let mut req = self.http.post(&url).json(body);
            if let Some(ref key) = self.config.api_key {
                req = req.header("Authorization", format!("Bearer {key}"));
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Resp>()
                        .await
                        .map_err(|e| InferenceError::Serialization(endpoint.path(), e.to_string()));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(
                        endpoint = endpoint.path(),
                        status = resp.status().as_u16(),
                        attempt,
                        "inference endpoint returned server error"
                    );
                    last_err = Some(InferenceError::Http(endpoint.path(), resp.status().as_u16()));
                }
                Ok(resp) => {
                    // 4xx: not retryable, surfaced immediately.
                    return Err(InferenceError::Http(endpoint.path(), resp.status().as_u16()));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(InferenceError::Timeout(endpoint.path()));
                }
                Err(e) => {
                    last_err = Some(InferenceError::Network(endpoint.path(), e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or(InferenceError::Timeout(endpoint.path())))
    }

    /// Run the full primary → failover → circuit dance for one RPC call
    /// (spec §4.3).
    async fn call<Req, Resp>(&self, endpoint: Endpoint, body: &Req) -> Result<Resp, InferenceError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let circuit_open = self.circuit_open(endpoint);

        if !circuit_open {
            match self.attempt(&self.config.primary_url, endpoint, body).await {
                Ok(resp) => {
                    self.note_success(endpoint);
                    return Ok(resp);
                }
                Err(primary_err) => {
                    self.note_failure(endpoint);
                    if !(self.config.failover_enabled && self.config.secondary_url.is_some()) {
                        return Err(primary_err);
                    }
                    debug!(endpoint = endpoint.path(), "primary failed, trying secondary");
                }
            }
        } else {
            info!(
                endpoint = endpoint.path(),
                "circuit open, bypassing primary"
            );
        }

        match &self.config.secondary_url {
            Some(secondary) if self.config.failover_enabled => {
                self.attempt(secondary, endpoint, body).await
            }
            _ => Err(InferenceError::UpstreamUnavailable(endpoint.path())),
        }
    }

    pub async fn extract_embedding(
        &self,
        req: &ExtractEmbeddingRequest,
    ) -> Result<ExtractEmbeddingResponse, InferenceError> {
        self.call(Endpoint::ExtractEmbedding, req).await
    }

    pub async fn score(&self, req: &ScoreRequest) -> Result<ScoreResponse, InferenceError> {
        self.call(Endpoint::Score, req).await
    }

    pub async fn resolve(&self, req: &ResolveRequest) -> Result<ResolveResponse, InferenceError> {
        self.call(Endpoint::Resolve, req).await
    }

    pub async fn enroll(&self, req: &EnrollRequest) -> Result<EnrollResponse, InferenceError> {
        self.call(Endpoint::Enroll, req).await
    }

    pub async fn analysis_events(
        &self,
        req: &AnalysisEventsRequest,
    ) -> Result<AnalysisEventsResponse, InferenceError> {
        self.call(Endpoint::AnalysisEvents, req).await
    }

    pub async fn analysis_report(
        &self,
        req: &AnalysisReportRequest,
    ) -> Result<AnalysisReportResponse, InferenceError> {
        self.call(Endpoint::AnalysisReport, req).await
    }

    pub async fn analysis_synthesize(
        &self,
        req: &AnalysisSynthesizeRequest,
    ) -> Result<AnalysisSynthesizeResponse, InferenceError> {
        self.call(Endpoint::AnalysisSynthesize, req).await
    }

    pub async fn analysis_regenerate_claim(
        &self,
        req: &RegenerateClaimRequest,
    ) -> Result<RegenerateClaimResponse, InferenceError> {
        self.call(Endpoint::AnalysisRegenerateClaim, req).await
    }

    /// Validate a presented credential against the configured API key in
    /// constant time (spec §4.3 "timing-safe header credential").
    pub fn authenticate(&self, presented: &str) -> bool {
        self.auth_header_ok(presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(primary: String, secondary: Option<String>) -> InferenceConfig {
        InferenceConfig {
            primary_url: primary,
            secondary_url: secondary,
            timeout_ms: 2_000,
            retry_max: 0,
            retry_backoff_ms: 1,
            circuit_open_ms: 200,
            failover_enabled: true,
            api_key: Some("worker-secret".to_string()),
        }
    }

    #[test]
    fn authenticate_uses_constant_time_comparison() {
        let client = InferenceClient::new(cfg("http://primary.invalid".to_string(), None));
        assert!(client.authenticate("worker-secret"));
        assert!(!client.authenticate("wrong"));
    }

    #[test]
    fn circuit_closed_initially() {
        let client = InferenceClient::new(cfg("http://primary.invalid".to_string(), None));
        assert!(!client.circuit_open(Endpoint::Resolve));
    }

    #[test]
    fn circuit_opens_after_failure_and_closes_after_window() {
        let client = InferenceClient::new(cfg("http://primary.invalid".to_string(), None));
        client.note_failure(Endpoint::Resolve);
        assert!(client.circuit_open(Endpoint::Resolve));

        std::thread::sleep(Duration::from_millis(250));
        assert!(!client.circuit_open(Endpoint::Resolve));
    }

    #[test]
    fn success_resets_circuit() {
        let client = InferenceClient::new(cfg("http://primary.invalid".to_string(), None));
        client.note_failure(Endpoint::Resolve);
        assert!(client.circuit_open(Endpoint::Resolve));
        client.note_success(Endpoint::Resolve);
        assert!(!client.circuit_open(Endpoint::Resolve));
    }
}
