//! Reconciler materialization (spec §4.6).
//!
//! A thin wrapper: read the session document, hand its per-stream
//! utterances to the pure `domain::reconciler` views. Neither view is
//! cached — recomputed on every call, per spec's "no persisted cache"
//! guarantee — except the finalize pipeline's one-shot artifact write in
//! [`ReconcileService::materialize`], which is a snapshot for the final
//! report, not a cache of the live view.

use database::{ChunkStoreTrait, SessionStoreTrait, StoreError};
use domain::model::{StreamRole, Utterance};
use domain::reconciler::{merged_view, raw_view};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptView {
    Raw,
    Merged,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("blob store error: {0}")]
    Blob(#[from] database::ChunkStoreError),
    #[error("failed to serialize merged transcript: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct ReconcileService {
    store: Arc<dyn SessionStoreTrait>,
    chunk_store: Arc<dyn ChunkStoreTrait>,
}

impl ReconcileService {
    pub fn new(store: Arc<dyn SessionStoreTrait>, chunk_store: Arc<dyn ChunkStoreTrait>) -> Self {
        Self { store, chunk_store }
    }

    /// Live `GET /v1/sessions/{id}/transcript?view=...` read path: always
    /// recomputed from the current document, never persisted.
    pub async fn transcript(
        &self,
        session_id: &str,
        view: TranscriptView,
    ) -> Result<Vec<Utterance>, StoreError> {
        let doc = self.store.get_or_create(session_id).await?;
        let teacher = doc
            .utterances_by_stream
            .get(&StreamRole::Teacher)
            .cloned()
            .unwrap_or_default();
        let students = doc
            .utterances_by_stream
            .get(&StreamRole::Students)
            .cloned()
            .unwrap_or_default();

        Ok(match view {
            TranscriptView::Raw => raw_view(&teacher, &students),
            TranscriptView::Merged => merged_view(&teacher, &students),
        })
    }

    /// Finalize-stage 4 materialization: compute the merged view and
    /// persist it as the session's transcript artifact. Returns the
    /// merged view so the caller (stage 5 Stats, stage 7 Report) doesn't
    /// have to re-read it back out of blob storage.
    pub async fn materialize(&self, session_id: &str) -> Result<Vec<Utterance>, ReconcileError> {
        let merged = self.transcript(session_id, TranscriptView::Merged).await?;
        let raw = self.transcript(session_id, TranscriptView::Raw).await?;

        let artifact = serde_json::json!({
            "session_id": session_id,
            "raw": raw,
            "merged": merged,
        });
        let bytes = serde_json::to_vec_pretty(&artifact)?;
        self.chunk_store
            .put_blob(&format!("sessions/{session_id}/transcript.json"), bytes)
            .await?;

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::{InMemoryChunkStore, InMemorySessionStore};
    use domain::model::{Decision, IdentitySource};

    fn utt(role: StreamRole, name: &str, text: &str, start_ms: i64, end_ms: i64) -> Utterance {
        Utterance {
            utterance_id: format!("u-{start_ms}"),
            stream_role: role,
            cluster_id: None,
            speaker_name: Some(name.to_string()),
            decision: Decision::Confirm,
            text: text.to_string(),
            start_ms,
            end_ms,
            is_final: true,
            identity_source: Some(IdentitySource::Teacher),
            evidence: None,
        }
    }

    #[tokio::test]
    async fn materialize_persists_a_blob_and_returns_merged_view() {
        let store = Arc::new(InMemorySessionStore::new());
        let chunk_store = Arc::new(InMemoryChunkStore::new());
        let svc = ReconcileService::new(store.clone(), chunk_store.clone());

        store
            .update(
                "s1",
                Box::new(|doc| {
                    doc.utterances_by_stream.insert(
                        StreamRole::Teacher,
                        vec![utt(StreamRole::Teacher, "Carol", "hello there", 0, 1000)],
                    );
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let merged = svc.materialize("s1").await.unwrap();
        assert_eq!(merged.len(), 1);

        let bytes = chunk_store
            .get_blob("sessions/s1/transcript.json")
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["session_id"], "s1");
    }

    #[tokio::test]
    async fn transcript_view_is_never_cached_between_calls() {
        let store = Arc::new(InMemorySessionStore::new());
        let chunk_store = Arc::new(InMemoryChunkStore::new());
        let svc = ReconcileService::new(store.clone(), chunk_store);

        let first = svc.transcript("s1", TranscriptView::Raw).await.unwrap();
        assert!(first.is_empty());

        store
            .update(
                "s1",
                Box::new(|doc| {
                    doc.utterances_by_stream.insert(
                        StreamRole::Teacher,
                        vec![utt(StreamRole::Teacher, "Carol", "hi", 0, 500)],
                    );
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let second = svc.transcript("s1", TranscriptView::Raw).await.unwrap();
        assert_eq!(second.len(), 1);
    }
}
