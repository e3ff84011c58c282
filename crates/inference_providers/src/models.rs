//! Wire types for the eight Inference Client endpoints (spec §4.3).
//!
//! The remote model-inference services (embedding extraction, name/score
//! resolution, enrollment, analysis/report synthesis) are out of scope
//! (spec §1); these structs are the contract the core consumes from them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct ExtractEmbeddingRequest {
    pub session_id: String,
    pub stream_role: String,
    pub audio_b64: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractEmbeddingResponse {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub embedding_a: Vec<f32>,
    pub embedding_b: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveRequest {
    pub session_id: String,
    pub cluster_id: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveResponse {
    pub speaker_name: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollRequest {
    pub session_id: String,
    pub participant_name: String,
    pub audio_b64: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollResponse {
    pub centroid: Vec<f32>,
    pub sample_count: u32,
    pub sample_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisEventsRequest {
    pub session_id: String,
    pub transcript: serde_json::Value,
    pub memos: serde_json::Value,
    pub stats: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisEventsResponse {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSynthesizeRequest {
    pub session_id: String,
    pub transcript: serde_json::Value,
    pub memos: serde_json::Value,
    pub evidence: serde_json::Value,
    pub stats: serde_json::Value,
    pub events: serde_json::Value,
    pub rubric: serde_json::Value,
    pub historical_context: serde_json::Value,
    /// Ids the returned claims' `evidence_refs` must be a subset of
    /// (spec §4.8 stage 7 validation).
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionReport {
    pub name: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSynthesizeResponse {
    #[serde(default)]
    pub dimensions: Vec<DimensionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReportRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisReportResponse {
    pub report: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegenerateClaimRequest {
    pub session_id: String,
    pub dimension: String,
    pub claim_text: String,
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateClaimResponse {
    pub claim: Claim,
}
