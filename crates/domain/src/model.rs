//! Core data model for the edge session core (spec §3).
//!
//! Every type here is persisted as part of a `SessionDocument` by the
//! Session State Store, or stored as raw bytes by the Chunk Store. Types
//! are deliberately plain data — behavior lives in `resolver`, `reconciler`
//! and in the `services` crate that drives them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The two synchronized ingest streams per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Teacher,
    Students,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Teacher => "teacher",
            StreamRole::Students => "students",
        }
    }
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teacher" => Ok(StreamRole::Teacher),
            "students" => Ok(StreamRole::Students),
            other => Err(format!("unknown stream_role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[serde(rename = "1v1")]
    OneOnOne,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Per-session configuration, set via `POST /v1/sessions/{id}/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub roster: Vec<RosterEntry>,
    pub interviewer_name: String,
    #[serde(default)]
    pub participant_priority: Option<Vec<String>>,
    #[serde(default)]
    pub stage_names: Vec<String>,
    #[serde(default)]
    pub dimension_rubric: serde_json::Value,
    /// Free-text operator note. Supplemental field (SPEC_FULL §3); inert,
    /// changes no invariant.
    #[serde(default)]
    pub notes: Option<String>,
    /// Operator-side categorization tags. Supplemental field.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Group,
            roster: Vec::new(),
            interviewer_name: String::new(),
            participant_priority: None,
            stage_names: Vec::new(),
            dimension_rubric: serde_json::Value::Null,
            notes: None,
            tags: Vec::new(),
        }
    }
}

/// Per-stream ingest bookkeeping (spec §3 `ingest_by_stream`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStreamState {
    pub chunks_received: u64,
    pub missing_seqs: BTreeSet<u64>,
    pub last_seq: u64,
    pub bytes_stored: u64,
    pub first_ts_ms: Option<i64>,
    pub last_ts_ms: Option<i64>,
}

impl IngestStreamState {
    /// Record the arrival of `seq`, tracking gaps against the previously
    /// observed `last_seq` (spec §4.1 invariant: a gap is exactly the
    /// difference between expected `prev+1` and observed `seq`).
    pub fn record_seq(&mut self, seq: u64) {
        if seq > self.last_seq + 1 {
            for missing in (self.last_seq + 1)..seq {
                self.missing_seqs.insert(missing);
            }
        }
        self.missing_seqs.remove(&seq);
        if seq > self.last_seq {
            self.last_seq = seq;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrWsState {
    Disconnected,
    Connecting,
    Running,
    Reconnecting,
    Closed,
}

/// Per-stream ASR driver bookkeeping (spec §3 `asr_by_stream`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrStreamState {
    pub mode: String,
    pub ws_state: AsrWsState,
    pub backlog_chunks: u64,
    pub ingest_lag_seconds: f64,
    pub last_emit_at: Option<i64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub last_error: Option<String>,
    /// Replay cursor persisted on every emitted final utterance and on
    /// graceful shutdown (spec §3, §9).
    pub last_sent_seq: u64,
    pub last_emitted_seq: u64,
}

impl Default for AsrStreamState {
    fn default() -> Self {
        Self {
            mode: "realtime".to_string(),
            ws_state: AsrWsState::Disconnected,
            backlog_chunks: 0,
            ingest_lag_seconds: 0.0,
            last_emit_at: None,
            p50_ms: None,
            p95_ms: None,
            last_error: None,
            last_sent_seq: 0,
            last_emitted_seq: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Capturing,
    Recovering,
}

/// Per-stream capture/echo bookkeeping (spec §3 `capture_by_stream`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStreamState {
    pub capture_state: CaptureState,
    pub recover_attempts: u32,
    pub last_recover_at: Option<i64>,
    pub last_recover_error: Option<String>,
    pub echo_suppressed_chunks: u64,
    pub echo_recent_rate: f64,
}

impl Default for CaptureStreamState {
    fn default() -> Self {
        Self {
            capture_state: CaptureState::Idle,
            recover_attempts: 0,
            last_recover_at: None,
            last_recover_error: None,
            echo_suppressed_chunks: 0,
            echo_recent_rate: 0.0,
        }
    }
}

/// Priority order is descending: earlier variants win over later ones
/// (spec §3). [`IdentitySource::rank`] gives the numeric priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    TeamsParticipants,
    Preconfig,
    EnrollmentMatch,
    NameExtract,
    Teacher,
    ManualMap,
    Unknown,
}

impl IdentitySource {
    pub fn rank(&self) -> u8 {
        match self {
            IdentitySource::TeamsParticipants => 0,
            IdentitySource::Preconfig => 1,
            IdentitySource::EnrollmentMatch => 2,
            IdentitySource::NameExtract => 3,
            IdentitySource::Teacher => 4,
            IdentitySource::ManualMap => 5,
            IdentitySource::Unknown => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Confirm,
    Unknown,
}

/// A time-bounded final ASR output attributed to a speaker (spec §3/glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub utterance_id: String,
    pub stream_role: StreamRole,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    pub decision: Decision,
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub is_final: bool,
    #[serde(default)]
    pub identity_source: Option<IdentitySource>,
    #[serde(default)]
    pub evidence: Option<serde_json::Value>,
}

impl Utterance {
    /// Enforce the hard rule from spec §3/§4.5/§7: `decision=confirm` is
    /// illegal when `speaker_name` is null. Rewrites in place and returns
    /// whether a rewrite happened (callers emit an `error` event when it
    /// does — scenario 5, P2).
    pub fn enforce_confirm_invariant(&mut self) -> bool {
        if matches!(self.decision, Decision::Confirm) && self.speaker_name.is_none() {
            self.decision = Decision::Unknown;
            true
        } else {
            false
        }
    }
}

/// A centroid in embedding space grouping utterances believed to come
/// from the same voice (glossary: Cluster).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub centroid: Vec<f32>,
    pub sample_count: u32,
    #[serde(default)]
    pub bound_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    TeamsParticipants,
    Preconfig,
    EnrollmentMatch,
    NameExtract,
    ManualMap,
}

/// Metadata about a persistent cluster -> speaker binding (glossary:
/// Binding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingMeta {
    pub source: BindingSource,
    pub confidence: f64,
    pub locked: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Collecting,
    Ready,
}

/// A named participant's reference voice profile, produced during
/// enrollment (glossary: Enrollment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub centroid: Vec<f32>,
    pub sample_count: u32,
    pub sample_seconds: f64,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentState {
    pub active: bool,
    pub active_participant: Option<String>,
    pub started_at: Option<i64>,
    /// The `students`-stream seq at the moment enrollment started, so
    /// `stop` knows which chunk range to extract a reference embedding
    /// from.
    pub start_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    AsrUtterance {
        stream_role: StreamRole,
        utterance_id: String,
    },
    ResolveDecision {
        stream_role: StreamRole,
        utterance_id: String,
        identity_source: IdentitySource,
    },
    IngestStats {
        stream_role: StreamRole,
        chunks_received: u64,
        missing: usize,
    },
    CaptureRecovery {
        stream_role: StreamRole,
        reason: String,
    },
    EnrollmentSample {
        participant_name: String,
        sample_seconds: f64,
    },
    ClusterMap {
        cluster_id: String,
        name: String,
        locked: bool,
    },
    FinalizeStage {
        stage: u8,
        name: String,
        degraded: bool,
    },
    Error {
        code: String,
        message: String,
    },
    /// One structured event returned by the `analysis/events` RPC (spec
    /// §4.8 stage 6), appended verbatim.
    AnalysisEvent {
        payload: serde_json::Value,
    },
    Mark {
        stream_role: StreamRole,
        payload: serde_json::Value,
    },
}

/// Append-only, strictly-increasing-and-dense-seq event log entry
/// (spec §3, P3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Finalization progress (spec §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeState {
    pub requested: bool,
    pub stage: u8,
    pub started_at: Option<i64>,
    pub stage_results: Vec<serde_json::Value>,
}

/// Full persisted session document (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub schema_version: u32,
    pub session_id: String,
    pub config: SessionConfig,
    pub ingest_by_stream: BTreeMap<StreamRole, IngestStreamState>,
    pub asr_by_stream: BTreeMap<StreamRole, AsrStreamState>,
    pub capture_by_stream: BTreeMap<StreamRole, CaptureStreamState>,
    pub utterances_by_stream: BTreeMap<StreamRole, Vec<Utterance>>,
    pub clusters: Vec<Cluster>,
    pub bindings: BTreeMap<String, String>,
    pub binding_meta: BTreeMap<String, BindingMeta>,
    pub participant_profiles: Vec<ParticipantProfile>,
    pub enrollment_state: EnrollmentState,
    pub events: Vec<Event>,
    pub finalize: FinalizeState,
    pub finalized: bool,
}

/// Current in-code schema version. Bump when `SessionDocument`'s shape
/// changes and extend `crate::migration::migrate` accordingly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl SessionDocument {
    pub fn new(session_id: impl Into<String>) -> Self {
        let mut ingest_by_stream = BTreeMap::new();
        let mut asr_by_stream = BTreeMap::new();
        let mut capture_by_stream = BTreeMap::new();
        let mut utterances_by_stream = BTreeMap::new();
        for role in [StreamRole::Teacher, StreamRole::Students] {
            ingest_by_stream.insert(role, IngestStreamState::default());
            asr_by_stream.insert(role, AsrStreamState::default());
            capture_by_stream.insert(role, CaptureStreamState::default());
            utterances_by_stream.insert(role, Vec::new());
        }

        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: session_id.into(),
            config: SessionConfig::default(),
            ingest_by_stream,
            asr_by_stream,
            capture_by_stream,
            utterances_by_stream,
            clusters: Vec::new(),
            bindings: BTreeMap::new(),
            binding_meta: BTreeMap::new(),
            participant_profiles: Vec::new(),
            enrollment_state: EnrollmentState::default(),
            events: Vec::new(),
            finalize: FinalizeState::default(),
            finalized: false,
        }
    }

    /// Append an event, assigning the next strictly increasing `seq`
    /// (spec P3). The session store must call this only under its
    /// per-session write lock.
    pub fn push_event(&mut self, ts_ms: i64, payload: EventPayload) -> u64 {
        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(Event {
            seq,
            ts_ms,
            payload,
        });
        seq
    }
}
