//! HTTP request/response shapes for the control API (spec §6).
//!
//! Fields typed on `domain::model` structs are annotated
//! `#[schema(value_type = Object)]` (or `Vec<Object>`): those types live in
//! a crate with no `utoipa` dependency, so they are documented as opaque
//! JSON rather than pulled into this crate's schema graph.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Standard error body returned by every control endpoint on failure
/// (SPEC_FULL §6: `{error, error_type}`).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_type: error_type.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: Option<String>,
    pub git_sha: Option<String>,
    pub asr_realtime_enabled: bool,
    pub asr_mode: String,
    pub asr_model: String,
    pub session_store_reachable: bool,
    pub chunk_store_reachable: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConfigRequest {
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub roster: Vec<domain::model::RosterEntry>,
    #[serde(default)]
    pub interviewer_name: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub mode: Option<domain::model::SessionMode>,
    #[serde(default)]
    pub participant_priority: Option<Vec<String>>,
    #[serde(default)]
    pub stage_names: Option<Vec<String>>,
    #[serde(default)]
    pub dimension_rubric: Option<serde_json::Value>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StateResponse {
    #[schema(value_type = Object)]
    pub session: domain::model::SessionDocument,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventsResponse {
    #[schema(value_type = Vec<Object>)]
    pub events: Vec<domain::model::Event>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UtterancesQuery {
    #[schema(value_type = Option<String>)]
    pub stream_role: Option<domain::model::StreamRole>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UtterancesResponse {
    #[schema(value_type = Vec<Object>)]
    pub utterances: Vec<domain::model::Utterance>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FinalizeResponse {
    pub stage: u8,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EnrollmentStartRequest {
    pub participant_name: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EnrollmentStateResponse {
    #[schema(value_type = Object)]
    pub state: domain::model::EnrollmentState,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ClusterMapRequest {
    pub cluster_id: String,
    pub name: String,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UnresolvedClustersResponse {
    #[schema(value_type = Vec<Object>)]
    pub clusters: Vec<domain::model::Cluster>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AsrRunRequest {
    #[schema(value_type = String)]
    pub stream_role: domain::model::StreamRole,
    pub from_seq: u64,
    pub to_seq: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AsrRunResponse {
    pub utterances_emitted: usize,
}

/// Resets every ASR driver task for the session (the orchestrator's
/// cancellation token is scoped per-session, not per-stream, so a
/// per-role reset isn't expressible without tearing down the other
/// stream's driver too).
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct AsrResetRequest {}
