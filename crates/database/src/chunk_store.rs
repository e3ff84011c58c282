//! Chunk Store (spec §4.1): append-only per-`(session, stream_role)`
//! ordered blob storage with gap tracking, plus a flat blob namespace
//! used for finalize-pipeline artifacts (merged transcript, `result.json`).

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use dashmap::DashMap;
use domain::model::StreamRole;
use std::collections::BTreeMap;
use thiserror::Error;

pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const BYTES_PER_SAMPLE: u32 = 2;
pub const NOMINAL_CHUNK_BYTES: usize = (SAMPLE_RATE_HZ * BYTES_PER_SAMPLE) as usize;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("chunk ({session_id}, {stream_role:?}, {seq}) already has different content")]
    ConflictingContent {
        session_id: String,
        stream_role: StreamRole,
        seq: u64,
    },
    #[error("chunk store backend error: {0}")]
    Backend(String),
    #[error("blob not found: {0}")]
    NotFound(String),
}

/// A single chunk within a `range` result. `bytes` is `None` for a seq
/// that was never written (a gap) — the caller reports it, not an error.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub seq: u64,
    pub bytes: Option<Vec<u8>>,
}

#[async_trait]
pub trait ChunkStoreTrait: Send + Sync {
    async fn put(
        &self,
        session_id: &str,
        role: StreamRole,
        seq: u64,
        bytes: Vec<u8>,
    ) -> Result<(), ChunkStoreError>;

    async fn range(
        &self,
        session_id: &str,
        role: StreamRole,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChunkEntry>, ChunkStoreError>;

    async fn assemble_wav(
        &self,
        session_id: &str,
        role: StreamRole,
    ) -> Result<Vec<u8>, ChunkStoreError>;

    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), ChunkStoreError>;

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, ChunkStoreError>;
}

fn chunk_object_key(bucket_prefix: &str, session_id: &str, role: StreamRole, seq: u64) -> String {
    format!(
        "{bucket_prefix}/{session_id}/chunks/{}/{seq:020}.pcm",
        role.as_str()
    )
}

/// Parses the zero-padded seq out of a `chunk_object_key`-shaped key's
/// file name, e.g. `.../chunks/teacher/00000000000000000042.pcm` -> 42.
fn parse_seq_from_object_key(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.strip_suffix(".pcm")?.parse().ok()
}

/// Builds a 44-byte canonical WAV header for 16kHz/mono/PCM16 data of
/// `data_len` bytes.
pub fn wav_header(data_len: u32) -> [u8; 44] {
    let mut header = [0u8; 44];
    let byte_rate = SAMPLE_RATE_HZ * BYTES_PER_SAMPLE;
    let block_align: u16 = BYTES_PER_SAMPLE as u16;
    let bits_per_sample: u16 = 16;
    let riff_chunk_size = 36 + data_len;

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&riff_chunk_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&1u16.to_le_bytes()); // mono
    header[24..28].copy_from_slice(&SAMPLE_RATE_HZ.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// S3-backed implementation. Each chunk is one object; S3 is the durable
/// source of truth (spec §4.4: "the durable audio log is the source of
/// truth, not the in-memory queue"). `written_seqs` is a best-effort
/// idempotency/gap cache populated as chunks are written or read back —
/// it speeds up the hot ingest path and the common case where `range`
/// is called shortly after `put`, but `range`/`assemble_wav` fall
/// through to `get_object`/`list_objects_v2` on a cache miss so a fresh
/// process (empty cache, e.g. after a restart) still sees every chunk
/// that was durably written before it started.
pub struct S3ChunkStore {
    client: S3Client,
    bucket: String,
    prefix: String,
    written_seqs: DashMap<(String, StreamRole), BTreeMap<u64, Vec<u8>>>,
}

impl S3ChunkStore {
    pub fn new(client: S3Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
            written_seqs: DashMap::new(),
        }
    }

    fn content_hash_matches(existing: &[u8], candidate: &[u8]) -> bool {
        existing == candidate
    }

    /// Read one chunk object straight from S3, treating a missing key as
    /// `Ok(None)` (a gap) rather than an error.
    async fn fetch_chunk_from_backend(&self, object_key: &str) -> Result<Option<Vec<u8>>, ChunkStoreError> {
        match self.client.get_object().bucket(&self.bucket).key(object_key).send().await {
            Ok(resp) => {
                let body = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("NoSuchKey") || message.contains("Not Found") || message.contains("404") {
                    Ok(None)
                } else {
                    Err(ChunkStoreError::Backend(message))
                }
            }
        }
    }

    /// Discover the highest seq ever written for `(session_id, role)` by
    /// listing the chunk object prefix, merged with whatever the
    /// in-memory cache already knows. Used by `assemble_wav`, which isn't
    /// on the hot ingest path and can afford the `list` round trip that
    /// `range`/`put` avoid.
    async fn discover_last_seq(&self, session_id: &str, role: StreamRole) -> Result<u64, ChunkStoreError> {
        let mut max_seq = self
            .written_seqs
            .get(&(session_id.to_string(), role))
            .and_then(|m| m.keys().next_back().copied())
            .unwrap_or(0);

        let list_prefix = format!("{}/{session_id}/chunks/{}/", self.prefix, role.as_str());
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(&list_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;

            for object in resp.contents() {
                if let Some(seq) = object.key().and_then(parse_seq_from_object_key) {
                    max_seq = max_seq.max(seq);
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(max_seq)
    }
}

#[async_trait]
impl ChunkStoreTrait for S3ChunkStore {
    async fn put(
        &self,
        session_id: &str,
        role: StreamRole,
        seq: u64,
        bytes: Vec<u8>,
    ) -> Result<(), ChunkStoreError> {
        let key = (session_id.to_string(), role);
        if let Some(existing) = self
            .written_seqs
            .get(&key)
            .and_then(|m| m.get(&seq).cloned())
        {
            if Self::content_hash_matches(&existing, &bytes) {
                return Ok(());
            }
            return Err(ChunkStoreError::ConflictingContent {
                session_id: session_id.to_string(),
                stream_role: role,
                seq,
            });
        }

        let object_key = chunk_object_key(&self.prefix, session_id, role, seq);
        // Cache miss doesn't mean "never written" — a prior process
        // instance (before a restart) may already hold this seq durably.
        if let Some(existing) = self.fetch_chunk_from_backend(&object_key).await? {
            if Self::content_hash_matches(&existing, &bytes) {
                self.written_seqs.entry(key).or_default().insert(seq, existing);
                return Ok(());
            }
            return Err(ChunkStoreError::ConflictingContent {
                session_id: session_id.to_string(),
                stream_role: role,
                seq,
            });
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.clone()))
            .send()
            .await
            .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;

        self.written_seqs
            .entry(key)
            .or_default()
            .insert(seq, bytes);
        Ok(())
    }

    async fn range(
        &self,
        session_id: &str,
        role: StreamRole,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChunkEntry>, ChunkStoreError> {
        let key = (session_id.to_string(), role);
        let mut out = Vec::with_capacity((to_seq.saturating_sub(from_seq) + 1) as usize);
        for seq in from_seq..=to_seq {
            let cached = self.written_seqs.get(&key).and_then(|m| m.get(&seq).cloned());
            let bytes = match cached {
                Some(bytes) => Some(bytes),
                None => {
                    let object_key = chunk_object_key(&self.prefix, session_id, role, seq);
                    let fetched = self.fetch_chunk_from_backend(&object_key).await?;
                    if let Some(bytes) = &fetched {
                        self.written_seqs.entry(key.clone()).or_default().insert(seq, bytes.clone());
                    }
                    fetched
                }
            };
            out.push(ChunkEntry { seq, bytes });
        }
        Ok(out)
    }

    async fn assemble_wav(
        &self,
        session_id: &str,
        role: StreamRole,
    ) -> Result<Vec<u8>, ChunkStoreError> {
        let last_seq = self.discover_last_seq(session_id, role).await?;

        let entries = self.range(session_id, role, 1, last_seq).await?;
        let mut pcm = Vec::with_capacity(entries.len() * NOMINAL_CHUNK_BYTES);
        for entry in &entries {
            match &entry.bytes {
                Some(bytes) => pcm.extend_from_slice(bytes),
                None => pcm.extend(std::iter::repeat(0u8).take(NOMINAL_CHUNK_BYTES)),
            }
        }

        let mut wav = Vec::with_capacity(44 + pcm.len());
        wav.extend_from_slice(&wav_header(pcm.len() as u32));
        wav.extend_from_slice(&pcm);
        Ok(wav)
    }

    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), ChunkStoreError> {
        let object_key = format!("{}/{}", self.prefix, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, ChunkStoreError> {
        let object_key = format!("{}/{}", self.prefix, key);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| ChunkStoreError::Backend(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }
}

/// In-memory implementation used by tests and by local/offline runs.
#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: DashMap<(String, StreamRole), BTreeMap<u64, Vec<u8>>>,
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStoreTrait for InMemoryChunkStore {
    async fn put(
        &self,
        session_id: &str,
        role: StreamRole,
        seq: u64,
        bytes: Vec<u8>,
    ) -> Result<(), ChunkStoreError> {
        let key = (session_id.to_string(), role);
        let mut entry = self.chunks.entry(key).or_default();
        if let Some(existing) = entry.get(&seq) {
            if existing == &bytes {
                return Ok(());
            }
            return Err(ChunkStoreError::ConflictingContent {
                session_id: session_id.to_string(),
                stream_role: role,
                seq,
            });
        }
        entry.insert(seq, bytes);
        Ok(())
    }

    async fn range(
        &self,
        session_id: &str,
        role: StreamRole,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChunkEntry>, ChunkStoreError> {
        let key = (session_id.to_string(), role);
        let map = self.chunks.get(&key);
        let mut out = Vec::new();
        for seq in from_seq..=to_seq {
            let bytes = map.as_ref().and_then(|m| m.get(&seq).cloned());
            out.push(ChunkEntry { seq, bytes });
        }
        Ok(out)
    }

    async fn assemble_wav(
        &self,
        session_id: &str,
        role: StreamRole,
    ) -> Result<Vec<u8>, ChunkStoreError> {
        let key = (session_id.to_string(), role);
        let last_seq = self
            .chunks
            .get(&key)
            .and_then(|m| m.keys().next_back().copied())
            .unwrap_or(0);
        let entries = self.range(session_id, role, 1, last_seq).await?;
        let mut pcm = Vec::with_capacity(entries.len() * NOMINAL_CHUNK_BYTES);
        for entry in &entries {
            match &entry.bytes {
                Some(bytes) => pcm.extend_from_slice(bytes),
                None => pcm.extend(std::iter::repeat(0u8).take(NOMINAL_CHUNK_BYTES)),
            }
        }
        let mut wav = Vec::with_capacity(44 + pcm.len());
        wav.extend_from_slice(&wav_header(pcm.len() as u32));
        wav.extend_from_slice(&pcm);
        Ok(wav)
    }

    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), ChunkStoreError> {
        self.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, ChunkStoreError> {
        self.blobs
            .get(key)
            .map(|b| b.clone())
            .ok_or_else(|| ChunkStoreError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8) -> Vec<u8> {
        vec![byte; NOMINAL_CHUNK_BYTES]
    }

    #[tokio::test]
    async fn put_is_idempotent_for_identical_bytes() {
        let store = InMemoryChunkStore::new();
        store
            .put("s1", StreamRole::Teacher, 1, chunk(7))
            .await
            .unwrap();
        store
            .put("s1", StreamRole::Teacher, 1, chunk(7))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn put_rejects_conflicting_content_for_same_key() {
        let store = InMemoryChunkStore::new();
        store
            .put("s1", StreamRole::Teacher, 1, chunk(7))
            .await
            .unwrap();
        let err = store
            .put("s1", StreamRole::Teacher, 1, chunk(9))
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::ConflictingContent { .. }));
    }

    #[tokio::test]
    async fn range_reports_gaps_as_none_not_errors() {
        let store = InMemoryChunkStore::new();
        store
            .put("s1", StreamRole::Teacher, 1, chunk(1))
            .await
            .unwrap();
        store
            .put("s1", StreamRole::Teacher, 3, chunk(3))
            .await
            .unwrap();

        let entries = store.range("s1", StreamRole::Teacher, 1, 3).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].bytes.is_some());
        assert!(entries[1].bytes.is_none());
        assert!(entries[2].bytes.is_some());
    }

    #[tokio::test]
    async fn assemble_wav_fills_gaps_with_silence_and_has_correct_duration() {
        let store = InMemoryChunkStore::new();
        store
            .put("s1", StreamRole::Teacher, 1, chunk(1))
            .await
            .unwrap();
        store
            .put("s1", StreamRole::Teacher, 3, chunk(3))
            .await
            .unwrap();

        let wav = store.assemble_wav("s1", StreamRole::Teacher).await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let data_len = u32::from_le_bytes(wav[40..44].try_into().unwrap()) as usize;
        assert_eq!(data_len, 3 * NOMINAL_CHUNK_BYTES);
        assert_eq!(wav.len(), 44 + data_len);

        // The gap at seq 2 is silence.
        let gap_start = 44 + NOMINAL_CHUNK_BYTES;
        let gap_end = gap_start + NOMINAL_CHUNK_BYTES;
        assert!(wav[gap_start..gap_end].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let store = InMemoryChunkStore::new();
        store
            .put_blob("sessions/s1/result.json", b"{}".to_vec())
            .await
            .unwrap();
        let bytes = store.get_blob("sessions/s1/result.json").await.unwrap();
        assert_eq!(bytes, b"{}".to_vec());
    }

    #[tokio::test]
    async fn missing_blob_errors_not_found() {
        let store = InMemoryChunkStore::new();
        let err = store.get_blob("sessions/missing").await.unwrap_err();
        assert!(matches!(err, ChunkStoreError::NotFound(_)));
    }
}
