//! Finalizer (spec §4.8): nine ordered, independently testable stages
//! triggered by `POST /v1/sessions/{id}/finalize`.
//!
//! Each stage is its own free function taking a [`FinalizeCtx`] — the
//! teacher's pattern of splitting a multi-step domain operation into
//! small, separately unit-testable steps (compare `audio::mod` splitting
//! transcode into discrete passes) rather than one monolithic function.

use crate::asr::{AsrError, EmittedUtterance};
use crate::now_ms;
use crate::reconcile::ReconcileService;
use crate::resolver::ResolverService;
use database::{ChunkStoreError, ChunkStoreTrait, SessionStoreTrait, StoreError};
use domain::model::{Decision, EventPayload, StreamRole, Utterance};
use inference_providers::{
    AnalysisEventsRequest, AnalysisReportRequest, AnalysisSynthesizeRequest, Claim,
    DimensionReport, InferenceClient, InferenceError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Stage 8 (persist) failure — the only truly fatal finalize outcome
    /// (spec §4.8, §7): the session is left at `finalize.stage=7` so a
    /// retried `finalize` call resumes from stage 8.
    #[error("failed to persist result.json: {0}")]
    Persist(#[from] ChunkStoreError),
}

/// Abstraction over the live per-`(session, stream_role)` ASR drivers the
/// Session Orchestrator owns, so the finalizer can freeze/drain/replay
/// them without depending on the orchestrator crate module directly
/// (kept here rather than duplicated per spec §4.9's "finalizer task"
/// wording — orchestrator supplies the concrete impl).
#[async_trait::async_trait]
pub trait AsrControl: Send + Sync {
    async fn freeze(&self, session_id: &str, role: StreamRole);
    async fn backlog_chunks(&self, session_id: &str, role: StreamRole) -> u64;
    async fn replay(
        &self,
        session_id: &str,
        role: StreamRole,
        from_seq: u64,
        to_seq: u64,
        window_ms: i64,
        hop_ms: i64,
    ) -> Result<Vec<EmittedUtterance>, AsrError>;
}

pub struct FinalizeCtx {
    pub store: Arc<dyn SessionStoreTrait>,
    pub chunk_store: Arc<dyn ChunkStoreTrait>,
    pub inference: Arc<InferenceClient>,
    pub reconcile: Arc<ReconcileService>,
    pub resolver: Arc<ResolverService>,
    pub asr: Arc<dyn AsrControl>,
    pub config: Arc<config::CoreConfig>,
}

/// Run the nine-stage pipeline, resuming from the stage after
/// `doc.finalize.stage` rather than always starting at 1: a retried call
/// after a fatal stage 8 (persist) failure must still be able to reach
/// stage 9 instead of being bounced back to the stale stage it already
/// completed (spec §4.8, §7's "retried `finalize` call resumes from
/// stage 8"). A session already at stage 9 returns immediately.
pub async fn finalize(ctx: &FinalizeCtx, session_id: &str) -> Result<u8, FinalizeError> {
    let doc = ctx.store.get_or_create(session_id).await?;
    let stage = doc.finalize.stage;
    if stage >= 9 {
        return Ok(stage);
    }

    if stage < 1 {
        stage1_freeze(ctx, session_id).await?;
    }
    if stage < 2 {
        stage2_drain(ctx, session_id).await?;
    }
    if stage < 3 {
        stage3_replay(ctx, session_id).await?;
    }
    if stage < 4 {
        stage4_reconcile(ctx, session_id).await?;
    }
    if stage < 5 {
        stage5_stats(ctx, session_id).await?;
    }
    if stage < 6 {
        stage6_events(ctx, session_id).await?;
    }
    if stage < 7 {
        stage7_report(ctx, session_id).await?;
    }
    if stage < 8 {
        stage8_persist(ctx, session_id).await?;
    }
    if stage < 9 {
        stage9_close(ctx, session_id).await?;
    }

    Ok(9)
}

/// Record stage completion: bump `finalize.stage`, append a
/// `finalize_stage` event (spec §4.8).
async fn mark_stage(
    store: &Arc<dyn SessionStoreTrait>,
    session_id: &str,
    stage: u8,
    name: &str,
    degraded: bool,
) -> Result<(), StoreError> {
    let name = name.to_string();
    store
        .update(
            session_id,
            Box::new(move |doc| {
                doc.finalize.stage = stage;
                doc.push_event(
                    now_ms(),
                    EventPayload::FinalizeStage {
                        stage,
                        name,
                        degraded,
                    },
                );
                Ok(())
            }),
        )
        .await?;
    Ok(())
}

/// Stage 1 — Freeze: mark `finalize.requested`; ingest keeps ACKing but
/// the ASR driver stops reading new frames.
pub async fn stage1_freeze(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    ctx.store
        .update(
            session_id,
            Box::new(|doc| {
                doc.finalize.requested = true;
                doc.finalize.started_at = Some(now_ms());
                Ok(())
            }),
        )
        .await?;
    for role in [StreamRole::Teacher, StreamRole::Students] {
        ctx.asr.freeze(session_id, role).await;
    }
    mark_stage(&ctx.store, session_id, 1, "freeze", false).await?;
    Ok(())
}

/// Stage 2 — Drain: wait until every stream's backlog is empty or 30s
/// elapses, whichever comes first.
pub async fn stage2_drain(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let timeout = Duration::from_secs(ctx.config.finalize.drain_timeout_secs);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut all_drained = true;
        for role in [StreamRole::Teacher, StreamRole::Students] {
            if ctx.asr.backlog_chunks(session_id, role).await > 0 {
                all_drained = false;
            }
        }
        if all_drained || tokio::time::Instant::now() >= deadline {
            if !all_drained {
                warn!(session_id, timeout_secs = ctx.config.finalize.drain_timeout_secs, "drain timed out, proceeding with persisted utterances");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    mark_stage(&ctx.store, session_id, 2, "drain", false).await?;
    Ok(())
}

/// Stage 3 — Replay: for any stream whose `last_emitted_seq < last_seq`,
/// run the one-shot windowed ASR pass over the missing range, then
/// resolve identity for each replayed utterance exactly like the live
/// path does.
pub async fn stage3_replay(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let doc = ctx.store.get_or_create(session_id).await?;
    let mut degraded = false;

    for role in [StreamRole::Teacher, StreamRole::Students] {
        let asr_state = doc.asr_by_stream.get(&role).cloned().unwrap_or_default();
        if asr_state.last_emitted_seq >= asr_state.last_seq {
            continue;
        }
        let from_seq = asr_state.last_emitted_seq + 1;
        let to_seq = asr_state.last_seq;
        let window_ms = (ctx.config.asr.replay_window_secs * 1000) as i64;
        let hop_ms = (ctx.config.asr.replay_hop_secs * 1000) as i64;

        match ctx.asr.replay(session_id, role, from_seq, to_seq, window_ms, hop_ms).await {
            Ok(utterances) => {
                for utt in utterances {
                    resolve_replayed(ctx, &utt).await;
                }
            }
            Err(e) => {
                degraded = true;
                error!(session_id, stream_role = %role, error = %e, "windowed replay pass failed, proceeding degraded");
            }
        }
    }

    mark_stage(&ctx.store, session_id, 3, "replay", degraded).await?;
    Ok(())
}

async fn resolve_replayed(ctx: &FinalizeCtx, utt: &EmittedUtterance) {
    let result = match utt.stream_role {
        StreamRole::Teacher => {
            ctx.resolver
                .resolve_teacher(&utt.session_id, utt.text.clone(), utt.start_ms, utt.end_ms)
                .await
        }
        StreamRole::Students => {
            ctx.resolver
                .resolve_students(&utt.session_id, utt.text.clone(), utt.start_ms, utt.end_ms)
                .await
        }
    };
    if let Err(e) = result {
        warn!(session_id = %utt.session_id, error = %e, "failed to persist replayed utterance");
    }
}

/// Stage 4 — Reconcile: materialize the merged view and persist it.
pub async fn stage4_reconcile(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    if let Err(e) = ctx.reconcile.materialize(session_id).await {
        error!(session_id, error = %e, "reconcile materialization failed");
    }
    mark_stage(&ctx.store, session_id, 4, "reconcile", false).await?;
    Ok(())
}

/// Stage 5 — Stats: compute per-speaker talk time, turns, interruptions
/// over the merged view stage 4 just materialized, store on the finalize
/// record. Using `raw_view` here would double-count adjacent same-speaker
/// runs and cross-stream near-duplicates that `merged_view` exists
/// specifically to coalesce away (spec §4.5, §4.8).
pub async fn stage5_stats(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let merged = ctx
        .reconcile
        .transcript(session_id, crate::reconcile::TranscriptView::Merged)
        .await
        .unwrap_or_default();
    let stats = domain::stats::compute_stats(&merged);
    let stats_value = serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null);

    ctx.store
        .update(
            session_id,
            Box::new(move |doc| {
                doc.finalize.stage_results.push(serde_json::json!({
                    "stage": "stats",
                    "stats": stats_value,
                }));
                Ok(())
            }),
        )
        .await?;
    mark_stage(&ctx.store, session_id, 5, "stats", false).await?;
    Ok(())
}

fn stage_result(doc: &domain::model::SessionDocument, stage_name: &str) -> serde_json::Value {
    doc.finalize
        .stage_results
        .iter()
        .rev()
        .find(|r| r.get("stage").and_then(|s| s.as_str()) == Some(stage_name))
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

/// Stage 6 — Events: call `analysis/events` with transcript+memos+stats;
/// append returned structured events. On `UpstreamUnavailable`, degrade
/// to an empty-events log rather than failing the pipeline (spec §4.8).
pub async fn stage6_events(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let doc = ctx.store.get_or_create(session_id).await?;
    let stats = stage_result(&doc, "stats");
    // No dedicated memo-capture subsystem exists in this system (open
    // question, resolved in DESIGN.md): memos is an empty array.
    let memos = serde_json::json!([]);
    let transcript = serde_json::to_value(
        ctx.reconcile
            .transcript(session_id, crate::reconcile::TranscriptView::Merged)
            .await
            .unwrap_or_default(),
    )
    .unwrap_or(serde_json::Value::Null);

    let req = AnalysisEventsRequest {
        session_id: session_id.to_string(),
        transcript,
        memos,
        stats,
    };

    let mut degraded = false;
    let events = match ctx.inference.analysis_events(&req).await {
        Ok(resp) => resp.events,
        Err(InferenceError::UpstreamUnavailable(_)) => {
            degraded = true;
            Vec::new()
        }
        Err(e) => {
            degraded = true;
            warn!(session_id, error = %e, "analysis/events call failed, proceeding with empty events");
            Vec::new()
        }
    };

    ctx.store
        .update(
            session_id,
            Box::new(move |doc| {
                for event in events {
                    doc.push_event(now_ms(), EventPayload::AnalysisEvent { payload: event });
                }
                Ok(())
            }),
        )
        .await?;

    mark_stage(&ctx.store, session_id, 6, "events", degraded).await?;
    Ok(())
}

fn validate_claims(dimensions: &[DimensionReport], evidence_ids: &[String]) -> bool {
    dimensions.iter().all(|d| {
        d.claims
            .iter()
            .all(|c| !c.evidence_refs.is_empty() && c.evidence_refs.iter().all(|r| evidence_ids.contains(r)))
    })
}

/// Build a memo-first degraded report: one claim per speaker turn from
/// the merged transcript, each citing its own utterance as evidence.
fn memo_first_report(merged: &[Utterance]) -> Vec<DimensionReport> {
    let claims: Vec<Claim> = merged
        .iter()
        .filter(|u| matches!(u.decision, Decision::Confirm))
        .map(|u| Claim {
            text: format!(
                "{} said: {}",
                u.speaker_name.as_deref().unwrap_or("unknown"),
                u.text
            ),
            evidence_refs: vec![u.utterance_id.clone()],
        })
        .collect();
    vec![DimensionReport {
        name: "transcript_summary".to_string(),
        claims,
    }]
}

/// Stage 7 — Report: call `analysis/synthesize`; validate every claim's
/// `evidence_refs` is a non-empty subset of the supplied evidence ids; on
/// failure or validation rejection, fall back to a memo-first report
/// (spec §4.8, scenario 6).
pub async fn stage7_report(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let doc = ctx.store.get_or_create(session_id).await?;
    let merged = ctx
        .reconcile
        .transcript(session_id, crate::reconcile::TranscriptView::Merged)
        .await
        .unwrap_or_default();
    let evidence_ids: Vec<String> = merged.iter().map(|u| u.utterance_id.clone()).collect();
    let evidence = serde_json::to_value(&merged).unwrap_or(serde_json::Value::Null);
    let transcript = evidence.clone();
    let stats = stage_result(&doc, "stats");

    let req = AnalysisSynthesizeRequest {
        session_id: session_id.to_string(),
        transcript,
        memos: serde_json::json!([]),
        evidence,
        stats,
        events: serde_json::to_value(&doc.events).unwrap_or(serde_json::Value::Null),
        rubric: doc.config.dimension_rubric.clone(),
        historical_context: serde_json::Value::Null,
        evidence_ids: evidence_ids.clone(),
    };

    let (dimensions, report_source) = match ctx.inference.analysis_synthesize(&req).await {
        Ok(resp) if validate_claims(&resp.dimensions, &evidence_ids) => {
            (resp.dimensions, "synthesize")
        }
        Ok(_) => {
            warn!(session_id, "synthesize response failed evidence validation, falling back to memo_first");
            (memo_first_report(&merged), "memo_first_fallback")
        }
        Err(e) => {
            warn!(session_id, error = %e, "analysis/synthesize failed, falling back to memo_first");
            (memo_first_report(&merged), "memo_first_fallback")
        }
    };

    let report_value = serde_json::json!({
        "dimensions": dimensions,
        "quality": { "report_source": report_source },
    });
    ctx.store
        .update(
            session_id,
            Box::new(move |doc| {
                doc.finalize.stage_results.push(serde_json::json!({
                    "stage": "report",
                    "report": report_value,
                }));
                Ok(())
            }),
        )
        .await?;

    mark_stage(&ctx.store, session_id, 7, "report", report_source == "memo_first_fallback").await?;
    Ok(())
}

/// Stage 8 — Persist: write the final `result.json` artifact.
pub async fn stage8_persist(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    let doc = ctx.store.get_or_create(session_id).await?;
    let merged = ctx
        .reconcile
        .transcript(session_id, crate::reconcile::TranscriptView::Merged)
        .await
        .unwrap_or_default();
    let result = serde_json::json!({
        "session_id": session_id,
        "transcript": merged,
        "stats": stage_result(&doc, "stats"),
        "report": stage_result(&doc, "report"),
        "events": doc.events,
    });
    let bytes = serde_json::to_vec_pretty(&result).unwrap_or_default();
    ctx.chunk_store
        .put_blob(&format!("sessions/{session_id}/result.json"), bytes)
        .await
        .inspect_err(|e| {
            error!(session_id, error = %e, "failed to persist result.json, leaving finalize.stage=7 for retry");
        })?;
    mark_stage(&ctx.store, session_id, 8, "persist", false).await?;
    Ok(())
}

/// Stage 9 — Close: mark the session final; subsequent ingest is
/// rejected with `session_finalized`.
pub async fn stage9_close(ctx: &FinalizeCtx, session_id: &str) -> Result<(), FinalizeError> {
    ctx.store
        .update(
            session_id,
            Box::new(|doc| {
                doc.finalized = true;
                Ok(())
            }),
        )
        .await?;
    mark_stage(&ctx.store, session_id, 9, "close", false).await?;
    info!(session_id, "finalize pipeline complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::{ChunkStoreTrait, InMemoryChunkStore, InMemorySessionStore};
    use domain::model::IdentitySource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn utt(name: &str, start_ms: i64, end_ms: i64) -> Utterance {
        Utterance {
            utterance_id: format!("u-{start_ms}"),
            stream_role: StreamRole::Students,
            cluster_id: None,
            speaker_name: Some(name.to_string()),
            decision: Decision::Confirm,
            text: "hi".to_string(),
            start_ms,
            end_ms,
            is_final: true,
            identity_source: Some(IdentitySource::EnrollmentMatch),
            evidence: None,
        }
    }

    #[test]
    fn stats_counts_turns_and_talk_time() {
        let raw = vec![utt("Alice", 0, 1000), utt("Alice", 1000, 2000)];
        let stats = domain::stats::compute_stats(&raw);
        assert_eq!(stats.per_speaker["Alice"].turns, 2);
        assert_eq!(stats.per_speaker["Alice"].talk_time_ms, 2000);
        assert_eq!(stats.per_speaker["Alice"].interruptions, 0);
    }

    #[test]
    fn stats_counts_interruption_from_different_speaker() {
        let raw = vec![utt("Alice", 0, 2000), utt("Bob", 500, 1500)];
        let stats = domain::stats::compute_stats(&raw);
        assert_eq!(stats.per_speaker["Bob"].interruptions, 1);
        assert_eq!(stats.per_speaker["Alice"].interruptions, 0);
    }

    #[test]
    fn validate_claims_rejects_empty_refs() {
        let dims = vec![DimensionReport {
            name: "d".to_string(),
            claims: vec![Claim {
                text: "x".to_string(),
                evidence_refs: vec![],
            }],
        }];
        assert!(!validate_claims(&dims, &["e1".to_string()]));
    }

    #[test]
    fn validate_claims_rejects_refs_outside_evidence_set() {
        let dims = vec![DimensionReport {
            name: "d".to_string(),
            claims: vec![Claim {
                text: "x".to_string(),
                evidence_refs: vec!["ghost".to_string()],
            }],
        }];
        assert!(!validate_claims(&dims, &["e1".to_string()]));
    }

    #[test]
    fn validate_claims_accepts_subset_refs() {
        let dims = vec![DimensionReport {
            name: "d".to_string(),
            claims: vec![Claim {
                text: "x".to_string(),
                evidence_refs: vec!["e1".to_string()],
            }],
        }];
        assert!(validate_claims(&dims, &["e1".to_string(), "e2".to_string()]));
    }

    #[test]
    fn memo_first_report_cites_own_utterance_as_evidence() {
        let merged = vec![utt("Alice", 0, 1000)];
        let dims = memo_first_report(&merged);
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].claims[0].evidence_refs, vec!["u-0".to_string()]);
    }

    struct NoopAsr;

    #[async_trait::async_trait]
    impl AsrControl for NoopAsr {
        async fn freeze(&self, _session_id: &str, _role: StreamRole) {}

        async fn backlog_chunks(&self, _session_id: &str, _role: StreamRole) -> u64 {
            0
        }

        async fn replay(
            &self,
            _session_id: &str,
            _role: StreamRole,
            _from_seq: u64,
            _to_seq: u64,
            _window_ms: i64,
            _hop_ms: i64,
        ) -> Result<Vec<EmittedUtterance>, AsrError> {
            Ok(Vec::new())
        }
    }

    /// Wraps [`InMemoryChunkStore`] and fails the first `put_blob` call for
    /// `result.json` specifically (stage 4's `transcript.json` write must
    /// keep succeeding) — stands in for a real backend that's transiently
    /// unavailable at stage 8, so a resumed `finalize()` call has
    /// something to retry.
    struct FlakyChunkStore {
        inner: InMemoryChunkStore,
        result_json_calls: AtomicUsize,
    }

    impl FlakyChunkStore {
        fn new() -> Self {
            Self {
                inner: InMemoryChunkStore::new(),
                result_json_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChunkStoreTrait for FlakyChunkStore {
        async fn put(
            &self,
            session_id: &str,
            role: StreamRole,
            seq: u64,
            bytes: Vec<u8>,
        ) -> Result<(), ChunkStoreError> {
            self.inner.put(session_id, role, seq, bytes).await
        }

        async fn range(
            &self,
            session_id: &str,
            role: StreamRole,
            from_seq: u64,
            to_seq: u64,
        ) -> Result<Vec<database::ChunkEntry>, ChunkStoreError> {
            self.inner.range(session_id, role, from_seq, to_seq).await
        }

        async fn assemble_wav(&self, session_id: &str, role: StreamRole) -> Result<Vec<u8>, ChunkStoreError> {
            self.inner.assemble_wav(session_id, role).await
        }

        async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), ChunkStoreError> {
            if key.ends_with("result.json") && self.result_json_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ChunkStoreError::Backend("transient outage".to_string()));
            }
            self.inner.put_blob(key, bytes).await
        }

        async fn get_blob(&self, key: &str) -> Result<Vec<u8>, ChunkStoreError> {
            self.inner.get_blob(key).await
        }
    }

    fn test_ctx(chunk_store: Arc<dyn ChunkStoreTrait>) -> FinalizeCtx {
        let store: Arc<dyn SessionStoreTrait> = Arc::new(InMemorySessionStore::new());
        let inference_config = config::InferenceConfig {
            primary_url: "http://localhost:9999".to_string(),
            secondary_url: None,
            timeout_ms: 100,
            retry_max: 1,
            retry_backoff_ms: 1,
            circuit_open_ms: 1000,
            failover_enabled: false,
            api_key: None,
        };
        let inference = Arc::new(InferenceClient::new(inference_config.clone()));
        let config = Arc::new(config::CoreConfig {
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
            inference: inference_config,
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
            finalize: config::FinalizeConfig { v2_enabled: false, drain_timeout_secs: 1 },
            worker_api_key: "secret".to_string(),
            logging: config::LoggingConfig::default(),
        });
        FinalizeCtx {
            store: store.clone(),
            chunk_store: chunk_store.clone(),
            inference: inference.clone(),
            reconcile: Arc::new(ReconcileService::new(store.clone(), chunk_store.clone())),
            resolver: Arc::new(ResolverService::new(
                inference,
                chunk_store,
                store,
                domain::resolver::ResolverThresholds::default(),
            )),
            asr: Arc::new(NoopAsr),
            config,
        }
    }

    #[tokio::test]
    async fn finalize_resumes_from_the_failed_stage_instead_of_restarting() {
        let chunk_store: Arc<dyn ChunkStoreTrait> = Arc::new(FlakyChunkStore::new());
        let ctx = test_ctx(chunk_store);
        let session_id = "sess-retry";

        let first = finalize(&ctx, session_id).await;
        assert!(matches!(first, Err(FinalizeError::Persist(_))));

        let doc = ctx.store.get_or_create(session_id).await.unwrap();
        assert_eq!(doc.finalize.stage, 7);

        let second = finalize(&ctx, session_id).await.unwrap();
        assert_eq!(second, 9);

        let doc = ctx.store.get_or_create(session_id).await.unwrap();
        assert!(doc.finalized);
        assert_eq!(doc.finalize.stage, 9);
    }
}
