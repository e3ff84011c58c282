//! Ingest Gateway (spec §4.7, §6): the `hello`/`chunk`/`mark`/`enrollment`/
//! `close` client frame protocol carried over the `/v1/audio/ws/{id}/{role}`
//! WebSocket the `api` crate terminates.
//!
//! The tagged-variant decode happens once at this boundary (Design Note
//! §9), same as the teacher's `realtime::ports::ClientEvent`; everything
//! past this module is statically dispatched.

use crate::now_ms;
use crate::orchestrator::SessionOrchestrator;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use database::{ChunkStoreError, StoreError};
use domain::model::{CaptureState, EventPayload, ParticipantProfile, StreamRole};
use inference_providers::EnrollRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        stream_role: StreamRole,
        #[allow(dead_code)]
        meeting_id: String,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
        #[serde(default = "default_format")]
        format: String,
        #[serde(default)]
        capture_mode: Option<String>,
        #[serde(default)]
        interviewer_name: Option<String>,
        #[serde(default)]
        teams_interviewer_name: Option<String>,
        #[serde(default)]
        teams_participants: Option<Vec<String>>,
    },
    Chunk {
        stream_role: StreamRole,
        #[allow(dead_code)]
        meeting_id: String,
        seq: u64,
        timestamp_ms: i64,
        sample_rate: u32,
        channels: u16,
        #[allow(dead_code)]
        format: String,
        content_b64: String,
    },
    Mark {
        stream_role: StreamRole,
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    Enrollment {
        stream_role: StreamRole,
        participant_name: String,
        #[serde(default)]
        start: bool,
        #[serde(default)]
        stop: bool,
    },
    Close {
        stream_role: StreamRole,
        #[allow(dead_code)]
        reason: String,
    },
}

fn default_sample_rate() -> u32 {
    database::chunk_store::SAMPLE_RATE_HZ
}
fn default_channels() -> u16 {
    1
}
fn default_format() -> String {
    "pcm_s16le".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready,
    Ack { seq: u64 },
    Error { code: String, message: String },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("session is already finalized")]
    SessionFinalized,
    #[error("chunk payload is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("failed to decode base64 payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] ChunkStoreError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::SessionFinalized => "session_finalized",
            IngestError::SizeMismatch { .. } => "invalid_chunk",
            IngestError::Decode(_) => "invalid_chunk",
            IngestError::Store(_) => "store_unavailable",
            IngestError::Blob(_) => "store_unavailable",
        }
    }
}

pub struct IngestGateway {
    orchestrator: Arc<SessionOrchestrator>,
}

impl IngestGateway {
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn handle_frame(
        &self,
        session_id: &str,
        frame: ClientFrame,
    ) -> Result<Option<ServerFrame>, IngestError> {
        match frame {
            ClientFrame::Hello {
                stream_role,
                interviewer_name,
                teams_interviewer_name,
                teams_participants,
                ..
            } => {
                self.handle_hello(session_id, stream_role, interviewer_name, teams_interviewer_name, teams_participants)
                    .await?;
                Ok(Some(ServerFrame::Ready))
            }
            ClientFrame::Chunk {
                stream_role,
                seq,
                timestamp_ms,
                sample_rate,
                channels,
                content_b64,
                ..
            } => {
                self.handle_chunk(session_id, stream_role, seq, timestamp_ms, sample_rate, channels, content_b64)
                    .await?;
                Ok(Some(ServerFrame::Ack { seq }))
            }
            ClientFrame::Mark { stream_role, payload } => {
                self.handle_mark(session_id, stream_role, payload).await?;
                Ok(None)
            }
            ClientFrame::Enrollment {
                stream_role,
                participant_name,
                start,
                stop,
            } => {
                self.handle_enrollment(session_id, stream_role, participant_name, start, stop)
                    .await?;
                Ok(None)
            }
            ClientFrame::Close { stream_role, .. } => {
                info!(session_id, stream_role = %stream_role, "client closed ingest stream");
                Ok(None)
            }
        }
    }

    async fn handle_hello(
        &self,
        session_id: &str,
        stream_role: StreamRole,
        interviewer_name: Option<String>,
        teams_interviewer_name: Option<String>,
        teams_participants: Option<Vec<String>>,
    ) -> Result<(), IngestError> {
        let store = self.orchestrator.store();
        let interviewer = interviewer_name.or(teams_interviewer_name);
        store
            .update(
                session_id,
                Box::new(move |doc| {
                    if let Some(name) = interviewer {
                        if doc.config.interviewer_name.is_empty() {
                            doc.config.interviewer_name = name;
                        }
                    }
                    if let Some(participants) = teams_participants {
                        for name in participants {
                            if !doc.config.roster.iter().any(|r| r.name == name) {
                                doc.config.roster.push(domain::model::RosterEntry { name, email: None });
                            }
                        }
                    }
                    doc.ingest_by_stream.entry(stream_role).or_default();
                    Ok(())
                }),
            )
            .await?;
        self.orchestrator.driver_for(session_id, stream_role);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chunk(
        &self,
        session_id: &str,
        stream_role: StreamRole,
        seq: u64,
        timestamp_ms: i64,
        sample_rate: u32,
        channels: u16,
        content_b64: String,
    ) -> Result<(), IngestError> {
        let store = self.orchestrator.store();
        let doc = store.get_or_create(session_id).await?;
        if doc.finalized {
            return Err(IngestError::SessionFinalized);
        }

        let bytes = BASE64
            .decode(content_b64)
            .map_err(|e| IngestError::Decode(e.to_string()))?;
        let expected = sample_rate as usize * channels as usize * 2;
        if bytes.len() != expected {
            return Err(IngestError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let chunk_store = self.orchestrator.chunk_store();
        chunk_store.put(session_id, stream_role, seq, bytes.clone()).await?;
        let bytes_len = bytes.len() as u64;
        let driver_bytes = bytes.clone();

        let gap_changed = store
            .update(
                session_id,
                Box::new(move |doc| {
                    let entry = doc.ingest_by_stream.entry(stream_role).or_default();
                    let before = entry.missing_seqs.len();
                    entry.record_seq(seq);
                    entry.chunks_received += 1;
                    entry.bytes_stored += bytes_len;
                    if entry.first_ts_ms.is_none() {
                        entry.first_ts_ms = Some(timestamp_ms);
                    }
                    entry.last_ts_ms = Some(timestamp_ms);
                    let changed = before != entry.missing_seqs.len();
                    if changed {
                        let chunks_received = entry.chunks_received;
                        let missing = entry.missing_seqs.len();
                        doc.push_event(
                            now_ms(),
                            EventPayload::IngestStats {
                                stream_role,
                                chunks_received,
                                missing,
                            },
                        );
                    }
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = gap_changed {
            warn!(session_id, stream_role = %stream_role, error = %e, "failed to persist ingest stats");
        }

        let driver = self.orchestrator.driver_for(session_id, stream_role);
        if !self.orchestrator.is_frozen(session_id, stream_role) {
            if let Some(dropped_seq) = driver.enqueue(seq, now_ms(), driver_bytes) {
                self.record_capture_recovery(session_id, stream_role, dropped_seq).await;
            }
        }
        Ok(())
    }

    async fn record_capture_recovery(&self, session_id: &str, stream_role: StreamRole, dropped_seq: u64) {
        let store = self.orchestrator.store();
        let reason = format!("send queue capacity exceeded, dropped seq {dropped_seq}");
        let result = store
            .update(
                session_id,
                Box::new(move |doc| {
                    let entry = doc.capture_by_stream.entry(stream_role).or_default();
                    entry.capture_state = CaptureState::Recovering;
                    entry.recover_attempts += 1;
                    entry.last_recover_at = Some(now_ms());
                    entry.last_recover_error = Some(reason.clone());
                    doc.push_event(
                        now_ms(),
                        EventPayload::CaptureRecovery {
                            stream_role,
                            reason,
                        },
                    );
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(session_id, stream_role = %stream_role, error = %e, "failed to persist capture recovery event");
        }
    }

    async fn handle_mark(
        &self,
        session_id: &str,
        stream_role: StreamRole,
        payload: serde_json::Value,
    ) -> Result<(), IngestError> {
        self.orchestrator
            .store()
            .update(
                session_id,
                Box::new(move |doc| {
                    doc.push_event(now_ms(), EventPayload::Mark { stream_role, payload });
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_enrollment(
        &self,
        session_id: &str,
        stream_role: StreamRole,
        participant_name: String,
        start: bool,
        stop: bool,
    ) -> Result<(), IngestError> {
        let store = self.orchestrator.store();

        if start {
            let name = participant_name.clone();
            store
                .update(
                    session_id,
                    Box::new(move |doc| {
                        let current_seq = doc
                            .ingest_by_stream
                            .get(&StreamRole::Students)
                            .map(|s| s.last_seq)
                            .unwrap_or(0);
                        doc.enrollment_state.active = true;
                        doc.enrollment_state.active_participant = Some(name);
                        doc.enrollment_state.started_at = Some(now_ms());
                        doc.enrollment_state.start_seq = Some(current_seq);
                        Ok(())
                    }),
                )
                .await?;
            return Ok(());
        }

        if stop {
            let doc = store.get_or_create(session_id).await?;
            let from_seq = doc.enrollment_state.start_seq.unwrap_or(0) + 1;
            let to_seq = doc
                .ingest_by_stream
                .get(&StreamRole::Students)
                .map(|s| s.last_seq)
                .unwrap_or(0);

            let mut sample_seconds = 0.0;
            let mut centroid = Vec::new();
            let mut sample_count = 0u32;
            if from_seq <= to_seq {
                let chunk_store = self.orchestrator.chunk_store();
                let entries = chunk_store
                    .range(session_id, StreamRole::Students, from_seq, to_seq)
                    .await?;
                let mut pcm = Vec::new();
                for entry in &entries {
                    if let Some(bytes) = &entry.bytes {
                        pcm.extend_from_slice(bytes);
                    }
                }
                sample_seconds = entries.len() as f64;
                if !pcm.is_empty() {
                    let req = EnrollRequest {
                        session_id: session_id.to_string(),
                        participant_name: participant_name.clone(),
                        audio_b64: BASE64.encode(&pcm),
                    };
                    match self.orchestrator.inference().enroll(&req).await {
                        Ok(resp) => {
                            centroid = resp.centroid;
                            sample_count = resp.sample_count;
                            sample_seconds = resp.sample_seconds;
                        }
                        Err(e) => {
                            warn!(session_id, error = %e, "enrollment RPC failed, no profile persisted");
                        }
                    }
                }
            }

            let name = participant_name.clone();
            store
                .update(
                    session_id,
                    Box::new(move |doc| {
                        doc.enrollment_state.active = false;
                        doc.enrollment_state.active_participant = None;
                        doc.enrollment_state.start_seq = None;
                        if !centroid.is_empty() {
                            if let Some(existing) = doc
                                .participant_profiles
                                .iter_mut()
                                .find(|p| p.name == name)
                            {
                                existing.centroid = centroid;
                                existing.sample_count = sample_count;
                                existing.sample_seconds = sample_seconds;
                                existing.status = domain::model::EnrollmentStatus::Ready;
                            } else {
                                doc.participant_profiles.push(ParticipantProfile {
                                    name: name.clone(),
                                    email: None,
                                    centroid,
                                    sample_count,
                                    sample_seconds,
                                    status: domain::model::EnrollmentStatus::Ready,
                                });
                            }
                        }
                        doc.push_event(
                            now_ms(),
                            EventPayload::EnrollmentSample {
                                participant_name: name,
                                sample_seconds,
                            },
                        );
                        Ok(())
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_parses_with_defaults() {
        let raw = r#"{"type":"hello","stream_role":"teacher","meeting_id":"m1"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Hello { sample_rate, channels, format, .. } => {
                assert_eq!(sample_rate, 16_000);
                assert_eq!(channels, 1);
                assert_eq!(format, "pcm_s16le");
            }
            _ => panic!("expected hello"),
        }
    }

    #[test]
    fn chunk_frame_parses() {
        let raw = r#"{"type":"chunk","stream_role":"students","meeting_id":"m1","seq":1,"timestamp_ms":0,"sample_rate":16000,"channels":1,"format":"pcm_s16le","content_b64":"AAAA"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, ClientFrame::Chunk { seq: 1, .. }));
    }

    #[test]
    fn ingest_error_codes_match_spec_taxonomy() {
        assert_eq!(IngestError::SessionFinalized.code(), "session_finalized");
        assert_eq!(
            IngestError::SizeMismatch { expected: 10, actual: 5 }.code(),
            "invalid_chunk"
        );
        assert_eq!(IngestError::Decode("bad base64".to_string()).code(), "invalid_chunk");
    }
}
