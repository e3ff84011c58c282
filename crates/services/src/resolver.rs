//! Async Speaker Resolver wrapper (spec §4.5).
//!
//! The only thing this module adds over `domain::resolver` is the
//! out-of-band embedding-extraction RPC and persistence through the
//! Session State Store; the decision itself is the single pure `resolve()`
//! ladder in `domain::resolver` (Design Note §9: no second policy path).
//! RPC and blob I/O happen outside the store's write lock, exactly as spec
//! §5 requires ("no lock is held across I/O").

use crate::now_ms;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use database::{ChunkStoreTrait, SessionStoreTrait, StoreError};
use domain::model::{BindingMeta, Cluster, EventPayload, IdentitySource, StreamRole, Utterance};
use domain::resolver::{self, ResolverError, ResolverThresholds};
use inference_providers::{ExtractEmbeddingRequest, InferenceClient};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolverServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

pub struct ResolverService {
    inference: Arc<InferenceClient>,
    chunk_store: Arc<dyn ChunkStoreTrait>,
    store: Arc<dyn SessionStoreTrait>,
    thresholds: ResolverThresholds,
    /// Cosine-similarity threshold for assigning an embedding to an
    /// existing voice cluster rather than minting a new one. Reuses the
    /// enrollment-match threshold (spec §9 open question: no separate
    /// clustering threshold is specified, so the documented enrollment
    /// default is the natural reuse).
    cluster_assignment_threshold: f32,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Assign `embedding` to the closest cluster within threshold, updating
/// its centroid by running average, or mint a fresh one.
fn assign_cluster(clusters: &mut Vec<Cluster>, embedding: &[f32], threshold: f32) -> String {
    if let Some(existing) = clusters
        .iter_mut()
        .find(|c| cosine_similarity(&c.centroid, embedding) >= threshold)
    {
        let n = existing.sample_count as f32;
        for (c, e) in existing.centroid.iter_mut().zip(embedding) {
            *c = (*c * n + *e) / (n + 1.0);
        }
        existing.sample_count += 1;
        return existing.cluster_id.clone();
    }
    let id = format!("cl-{}", Uuid::new_v4());
    clusters.push(Cluster {
        cluster_id: id.clone(),
        centroid: embedding.to_vec(),
        sample_count: 1,
        bound_name: None,
    });
    id
}

/// 1 chunk == 1 nominal second (spec glossary); map a millisecond range to
/// the chunk seqs covering it.
fn ms_range_to_seqs(start_ms: i64, end_ms: i64) -> (u64, u64) {
    let from_seq = (start_ms.max(0) / 1000) as u64 + 1;
    let to_seq_raw = ((end_ms.max(0) + 999) / 1000) as u64;
    (from_seq, to_seq_raw.max(from_seq))
}

impl ResolverService {
    pub fn new(
        inference: Arc<InferenceClient>,
        chunk_store: Arc<dyn ChunkStoreTrait>,
        store: Arc<dyn SessionStoreTrait>,
        thresholds: ResolverThresholds,
    ) -> Self {
        Self {
            inference,
            chunk_store,
            store,
            thresholds,
            cluster_assignment_threshold: thresholds.enrollment_top_score_min,
        }
    }

    /// Bind a teacher-stream utterance directly by priority — no RPC, no
    /// ladder (spec §4.5).
    pub async fn resolve_teacher(
        &self,
        session_id: &str,
        text: String,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(), StoreError> {
        self.store
            .update(
                session_id,
                Box::new(move |doc| {
                    let resolution = resolver::resolve_teacher(&doc.config.interviewer_name);
                    let mut utterance = Utterance {
                        utterance_id: format!("utt-{}", Uuid::new_v4()),
                        stream_role: StreamRole::Teacher,
                        cluster_id: None,
                        speaker_name: resolution.speaker_name.clone(),
                        decision: resolution.decision,
                        text,
                        start_ms,
                        end_ms,
                        is_final: true,
                        identity_source: resolution.identity_source,
                        evidence: None,
                    };
                    let rewritten = utterance.enforce_confirm_invariant();
                    apply_resolution(doc, utterance, rewritten, resolution.identity_source);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Run the full resolution ladder for a `students`-stream utterance
    /// (spec §4.5): extract an embedding for the utterance's audio window,
    /// then decide and persist.
    pub async fn resolve_students(
        &self,
        session_id: &str,
        text: String,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(), StoreError> {
        let embedding = self.extract_embedding(session_id, &text, start_ms, end_ms).await;
        let thresholds = self.thresholds;
        let cluster_threshold = self.cluster_assignment_threshold;

        self.store
            .update(
                session_id,
                Box::new(move |doc| {
                    let cluster_id = embedding
                        .as_ref()
                        .map(|e| assign_cluster(&mut doc.clusters, e, cluster_threshold));

                    let mut resolution = resolver::resolve_students(
                        &text,
                        cluster_id.as_deref(),
                        embedding.as_deref(),
                        &doc.clusters,
                        &doc.bindings,
                        &doc.binding_meta,
                        &doc.participant_profiles,
                        &doc.config.roster,
                        thresholds,
                    );

                    if let Some(new_binding) = resolution.new_binding.take() {
                        doc.bindings
                            .insert(new_binding.cluster_id.clone(), new_binding.name.clone());
                        doc.binding_meta.insert(
                            new_binding.cluster_id,
                            BindingMeta {
                                source: new_binding.source,
                                confidence: new_binding.confidence,
                                locked: new_binding.locked,
                                updated_at: now_ms(),
                            },
                        );
                    }

                    let mut utterance = Utterance {
                        utterance_id: format!("utt-{}", Uuid::new_v4()),
                        stream_role: StreamRole::Students,
                        cluster_id,
                        speaker_name: resolution.speaker_name.clone(),
                        decision: resolution.decision,
                        text,
                        start_ms,
                        end_ms,
                        is_final: true,
                        identity_source: resolution.identity_source,
                        evidence: None,
                    };
                    let rewritten = utterance.enforce_confirm_invariant();
                    apply_resolution(doc, utterance, rewritten, resolution.identity_source);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Best-effort embedding extraction; a failure degrades resolution (the
    /// ladder still runs with `embedding=None`) rather than stalling ingest
    /// (spec §5: "a slow resolve does not delay further utterances").
    async fn extract_embedding(
        &self,
        session_id: &str,
        text: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Option<Vec<f32>> {
        let (from_seq, to_seq) = ms_range_to_seqs(start_ms, end_ms);
        let entries = match self
            .chunk_store
            .range(session_id, StreamRole::Students, from_seq, to_seq)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(session_id, error = %e, "failed to read audio window for embedding extraction");
                return None;
            }
        };

        let mut pcm = Vec::new();
        for entry in entries {
            if let Some(bytes) = entry.bytes {
                pcm.extend(bytes);
            }
        }
        if pcm.is_empty() {
            debug!(session_id, "no audio available for embedding window, skipping enrollment-match step");
            return None;
        }

        let req = ExtractEmbeddingRequest {
            session_id: session_id.to_string(),
            stream_role: StreamRole::Students.as_str().to_string(),
            audio_b64: BASE64.encode(&pcm),
            start_ms,
            end_ms,
        };

        match self.inference.extract_embedding(&req).await {
            Ok(resp) => Some(resp.embedding),
            Err(e) => {
                warn!(session_id, text, error = %e, "embedding extraction failed, resolving without it");
                None
            }
        }
    }

    /// Manual override (spec §4.5): writes `binding_meta` unconditionally,
    /// but only after validating the cluster exists — this closes the
    /// "dangling binding" hole called out in Design Note §9 / invariant P6.
    pub async fn cluster_map(
        &self,
        session_id: &str,
        cluster_id: String,
        name: String,
        locked: bool,
    ) -> Result<(), ResolverServiceError> {
        let doc = self.store.get_or_create(session_id).await?;
        resolver::validate_cluster_map(&doc.clusters, &cluster_id)?;

        self.store
            .update(
                session_id,
                Box::new(move |doc| {
                    doc.bindings.insert(cluster_id.clone(), name.clone());
                    doc.binding_meta.insert(
                        cluster_id.clone(),
                        BindingMeta {
                            source: domain::model::BindingSource::ManualMap,
                            confidence: 1.0,
                            locked,
                            updated_at: now_ms(),
                        },
                    );
                    doc.push_event(
                        now_ms(),
                        EventPayload::ClusterMap {
                            cluster_id,
                            name,
                            locked,
                        },
                    );
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

/// Append the utterance, its `resolve_decision`/`asr_utterance` events, and
/// (if the confirm-without-name invariant fired) an `error` event — shared
/// by both the teacher and students resolution paths.
fn apply_resolution(
    doc: &mut domain::model::SessionDocument,
    utterance: Utterance,
    rewritten: bool,
    identity_source: Option<IdentitySource>,
) {
    let utterance_id = utterance.utterance_id.clone();
    let stream_role = utterance.stream_role;
    doc.utterances_by_stream
        .entry(stream_role)
        .or_default()
        .push(utterance);

    doc.push_event(
        now_ms(),
        EventPayload::AsrUtterance {
            stream_role,
            utterance_id: utterance_id.clone(),
        },
    );
    doc.push_event(
        now_ms(),
        EventPayload::ResolveDecision {
            stream_role,
            utterance_id: utterance_id.clone(),
            identity_source: identity_source.unwrap_or(IdentitySource::Unknown),
        },
    );
    if rewritten {
        doc.push_event(
            now_ms(),
            EventPayload::Error {
                code: "confirm_without_name".to_string(),
                message: format!("utterance {utterance_id} rewritten from confirm to unknown"),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_assignment_reuses_similar_cluster() {
        let mut clusters = vec![Cluster {
            cluster_id: "c1".to_string(),
            centroid: vec![1.0, 0.0],
            sample_count: 1,
            bound_name: None,
        }];
        let id = assign_cluster(&mut clusters, &[1.0, 0.0], 0.72);
        assert_eq!(id, "c1");
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].sample_count, 2);
    }

    #[test]
    fn cluster_assignment_mints_new_cluster_below_threshold() {
        let mut clusters = vec![Cluster {
            cluster_id: "c1".to_string(),
            centroid: vec![1.0, 0.0],
            sample_count: 1,
            bound_name: None,
        }];
        let id = assign_cluster(&mut clusters, &[0.0, 1.0], 0.72);
        assert_ne!(id, "c1");
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn ms_range_maps_to_one_indexed_seqs() {
        assert_eq!(ms_range_to_seqs(0, 999), (1, 1));
        assert_eq!(ms_range_to_seqs(2000, 2999), (3, 3));
        assert_eq!(ms_range_to_seqs(0, 2500), (1, 3));
    }
}
