//! ASR Driver (spec §4.4): one persistent realtime-ASR session per
//! `(session_id, stream_role)`.
//!
//! Grounded on the teacher's `realtime` service shape — a task-per-connection
//! worker framing JSON events at the boundary (`realtime::ports::ClientEvent`/
//! `ServerEvent`) — generalized from a request-scoped client WebSocket to a
//! long-lived upstream WebSocket owned by the Session Orchestrator, with its
//! replay cursor persisted through the Session State Store (Design Note §9).

pub mod protocol;

use crate::now_ms;
use database::{ChunkStoreTrait, SessionStoreTrait};
use domain::model::{AsrWsState, StreamRole};
use futures_util::{SinkExt, StreamExt};
use protocol::{RunTask, UpstreamEvent};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("upstream ASR endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("upstream ASR protocol violation: {0}")]
    Protocol(String),
    #[error("driver cancelled")]
    Cancelled,
}

/// One outbound audio frame waiting to be sent upstream, stamped with the
/// ingest timestamp it arrived with (spec §4.4 latency histogram).
struct QueuedChunk {
    seq: u64,
    ingest_ts_ms: i64,
    bytes: Vec<u8>,
}

/// A final utterance emitted by the driver, handed to whatever routes it
/// onward (the Speaker Resolver for `students`, direct teacher binding for
/// `teacher` — spec §4.5).
#[derive(Debug, Clone)]
pub struct EmittedUtterance {
    pub session_id: String,
    pub stream_role: StreamRole,
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Rolling latency samples backing `ingest_to_utterance_p50/p95` (spec
/// §4.4). Capped so memory is bounded for long-running sessions.
struct LatencyHistogram {
    samples: VecDeque<f64>,
}

const LATENCY_SAMPLE_CAP: usize = 256;

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAP),
        }
    }

    fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == LATENCY_SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx).copied()
    }
}

/// Bounded FIFO of outbound chunks; over capacity, the oldest is dropped
/// (spec §4.4 / §4.7 step 4).
struct SendQueue {
    chunks: VecDeque<QueuedChunk>,
    cap: usize,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Returns the seq that was dropped to make room, if any.
    fn push(&mut self, chunk: QueuedChunk) -> Option<u64> {
        let dropped = if self.chunks.len() >= self.cap {
            self.chunks.pop_front().map(|c| c.seq)
        } else {
            None
        };
        self.chunks.push_back(chunk);
        dropped
    }

    fn pop(&mut self) -> Option<QueuedChunk> {
        self.chunks.pop_front()
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Backoff schedule for `task-failed`/connection-drop reconnects (spec
/// §4.4): 1s, 2s, 5s, then capped at 5s indefinitely.
fn backoff_for_attempt(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::from_secs(1),
        1 => Duration::from_secs(2),
        _ => Duration::from_secs(5),
    }
}

pub struct AsrDriver {
    session_id: String,
    stream_role: StreamRole,
    model: String,
    upstream_url: String,
    queue: Mutex<SendQueue>,
    latency: Mutex<LatencyHistogram>,
    store: std::sync::Arc<dyn SessionStoreTrait>,
    chunk_store: std::sync::Arc<dyn ChunkStoreTrait>,
    cancel: tokio_util::sync::CancellationToken,
}

impl AsrDriver {
    pub fn new(
        session_id: String,
        stream_role: StreamRole,
        model: String,
        upstream_url: String,
        send_queue_cap: usize,
        store: std::sync::Arc<dyn SessionStoreTrait>,
        chunk_store: std::sync::Arc<dyn ChunkStoreTrait>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            session_id,
            stream_role,
            model,
            upstream_url,
            queue: Mutex::new(SendQueue::new(send_queue_cap)),
            latency: Mutex::new(LatencyHistogram::new()),
            store,
            chunk_store,
            cancel,
        }
    }

    /// Enqueue a chunk for upstream delivery. Returns the dropped seq, if
    /// the queue was at capacity (caller records a `capture_recovery`
    /// event — spec §4.7 step 4).
    pub fn enqueue(&self, seq: u64, ingest_ts_ms: i64, bytes: Vec<u8>) -> Option<u64> {
        self.queue.lock().expect("send queue poisoned").push(QueuedChunk {
            seq,
            ingest_ts_ms,
            bytes,
        })
    }

    pub fn backlog_len(&self) -> usize {
        self.queue.lock().expect("send queue poisoned").len()
    }

    async fn set_ws_state(&self, state: AsrWsState, last_error: Option<String>) {
        let session_id = self.session_id.clone();
        let role = self.stream_role;
        let result = self
            .store
            .update(
                &session_id,
                Box::new(move |doc| {
                    let entry = doc.asr_by_stream.entry(role).or_default();
                    entry.ws_state = state;
                    entry.last_error = last_error;
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.session_id, stream_role = %self.stream_role, error = %e, "failed to persist asr_ws_state");
        }
    }

    /// Persist the replay cursor on every emitted final utterance and on
    /// graceful shutdown (spec §3, §9).
    async fn persist_cursor(&self, last_sent_seq: u64, last_emitted_seq: u64) {
        let session_id = self.session_id.clone();
        let role = self.stream_role;
        let result = self
            .store
            .update(
                &session_id,
                Box::new(move |doc| {
                    let entry = doc.asr_by_stream.entry(role).or_default();
                    entry.last_sent_seq = entry.last_sent_seq.max(last_sent_seq);
                    entry.last_emitted_seq = entry.last_emitted_seq.max(last_emitted_seq);
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.session_id, stream_role = %self.stream_role, error = %e, "failed to persist replay cursor");
        }
    }

    /// Rebuild the in-memory send queue from the Chunk Store on startup
    /// (Design Note §9): the durable audio log is the source of truth,
    /// never the in-memory queue that a crash would have lost.
    pub async fn resume_from_chunk_store(&self, from_seq: u64, to_seq: u64) {
        if from_seq > to_seq {
            return;
        }
        let entries = match self
            .chunk_store
            .range(&self.session_id, self.stream_role, from_seq, to_seq)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to read chunk store for replay resume");
                return;
            }
        };
        let now = now_ms();
        for entry in entries {
            if let Some(bytes) = entry.bytes {
                self.enqueue(entry.seq, now, bytes);
            }
        }
        info!(session_id = %self.session_id, stream_role = %self.stream_role, from_seq, to_seq, "resumed send queue from chunk store");
    }

    /// Drive the connect → run → (error → reconnect)* state machine until
    /// cancelled (spec §4.4). Upstream failures never propagate to the
    /// caller; they only degrade `asr_ws_state`.
    pub async fn run(self: std::sync::Arc<Self>, utterance_tx: mpsc::Sender<EmittedUtterance>) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.set_ws_state(AsrWsState::Closed, None).await;
                return;
            }

            self.set_ws_state(AsrWsState::Connecting, None).await;
            match self.connect_and_drive(&utterance_tx).await {
                Ok(()) => {
                    // Graceful `task-finished`/cancellation.
                    self.set_ws_state(AsrWsState::Closed, None).await;
                    return;
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, stream_role = %self.stream_role, error = %e, "asr driver error, reconnecting");
                    self.set_ws_state(AsrWsState::Reconnecting, Some(e.to_string()))
                        .await;
                    let delay = backoff_for_attempt(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.set_ws_state(AsrWsState::Closed, None).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_drive(
        &self,
        utterance_tx: &mpsc::Sender<EmittedUtterance>,
    ) -> Result<(), AsrError> {
        let (ws_stream, _resp) = tokio_tungstenite::connect_async(&self.upstream_url)
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let task_id = uuid::Uuid::new_v4().to_string();
        let run_task = RunTask::new(task_id, self.model.clone(), database::chunk_store::SAMPLE_RATE_HZ);
        let run_task_json = serde_json::to_string(&run_task)
            .map_err(|e| AsrError::Protocol(format!("failed to encode run-task: {e}")))?;
        write
            .send(Message::Text(run_task_json))
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;

        self.set_ws_state(AsrWsState::Running, None).await;

        let mut last_sent_seq: u64 = 0;
        let mut last_emitted_seq: u64 = 0;
        let mut current_start_ms: Option<i64> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                // Drain any queued outbound chunks before waiting on the
                // next inbound event, matching spec §5's "send order
                // matches seq order".
                _ = tokio::time::sleep(Duration::from_millis(20)) => {
                    while let Some(chunk) = self.queue.lock().expect("send queue poisoned").pop() {
                        if write.send(Message::Binary(chunk.bytes)).await.is_err() {
                            return Err(AsrError::Unreachable("write failed mid-stream".to_string()));
                        }
                        last_sent_seq = last_sent_seq.max(chunk.seq);
                        if current_start_ms.is_none() {
                            current_start_ms = Some(chunk.ingest_ts_ms);
                        }
                    }
                }

                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(AsrError::Unreachable("upstream closed the connection".to_string()));
                    };
                    let msg = msg.map_err(|e| AsrError::Unreachable(e.to_string()))?;
                    let Message::Text(text) = msg else { continue };

                    let event: UpstreamEvent = match serde_json::from_str(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!(session_id = %self.session_id, error = %e, raw = %text, "ignoring unparseable upstream frame");
                            continue;
                        }
                    };

                    match event {
                        UpstreamEvent::TaskStarted => {
                            debug!(session_id = %self.session_id, stream_role = %self.stream_role, "asr task started");
                        }
                        UpstreamEvent::ResultGenerated(result) => {
                            if !result.is_final_marker() {
                                continue;
                            }
                            let start_ms = current_start_ms.unwrap_or(result.offset_ms);
                            let end_ms = start_ms + result.duration_ms.max(0);
                            current_start_ms = None;
                            last_emitted_seq = last_sent_seq;

                            if let Some(ingest_ts) = Some(start_ms) {
                                let latency = (now_ms() - ingest_ts).max(0) as f64;
                                self.latency.lock().expect("latency histogram poisoned").record(latency);
                            }
                            self.persist_percentiles().await;
                            self.persist_cursor(last_sent_seq, last_emitted_seq).await;

                            let emitted = EmittedUtterance {
                                session_id: self.session_id.clone(),
                                stream_role: self.stream_role,
                                text: result.text,
                                start_ms,
                                end_ms,
                            };
                            if utterance_tx.send(emitted).await.is_err() {
                                warn!(session_id = %self.session_id, "utterance receiver dropped, asr driver stopping");
                                return Ok(());
                            }
                        }
                        UpstreamEvent::TaskFinished => {
                            info!(session_id = %self.session_id, stream_role = %self.stream_role, "asr task finished");
                            self.persist_cursor(last_sent_seq, last_emitted_seq).await;
                            return Ok(());
                        }
                        UpstreamEvent::TaskFailed { code, message } => {
                            return Err(AsrError::Protocol(format!("{code}: {message}")));
                        }
                    }
                }
            }
        }
    }

    /// One-shot windowed replay pass (spec §4.8 stage 3): the sole
    /// remaining use of a non-realtime, windowed ASR invocation. Slides a
    /// `window_ms`-wide, `hop_ms`-hopping window over `[from_seq, to_seq]`
    /// and opens a short-lived connection per window rather than reusing
    /// the long-lived streaming one `connect_and_drive` owns.
    pub async fn replay_window(
        &self,
        from_seq: u64,
        to_seq: u64,
        window_ms: i64,
        hop_ms: i64,
    ) -> Result<Vec<EmittedUtterance>, AsrError> {
        if from_seq > to_seq {
            return Ok(Vec::new());
        }
        let entries = self
            .chunk_store
            .range(&self.session_id, self.stream_role, from_seq, to_seq)
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;

        let mut pcm = Vec::new();
        for entry in &entries {
            match &entry.bytes {
                Some(bytes) => pcm.extend_from_slice(bytes),
                None => pcm.extend(
                    std::iter::repeat(0u8).take(database::chunk_store::NOMINAL_CHUNK_BYTES),
                ),
            }
        }
        if pcm.is_empty() {
            return Ok(Vec::new());
        }

        let bytes_per_ms = (database::chunk_store::SAMPLE_RATE_HZ as i64
            * database::chunk_store::BYTES_PER_SAMPLE as i64)
            / 1000;
        let window_bytes = (window_ms * bytes_per_ms).max(bytes_per_ms) as usize;
        let hop_bytes = (hop_ms * bytes_per_ms).max(bytes_per_ms) as usize;
        let base_ms = from_seq.saturating_sub(1) as i64 * 1000;

        let mut utterances = Vec::new();
        let mut offset = 0usize;
        loop {
            let end = (offset + window_bytes).min(pcm.len());
            let window_start_ms = base_ms + (offset as i64 * 1000) / bytes_per_ms.max(1);

            match self.run_one_shot_window(&pcm[offset..end], window_start_ms).await {
                Ok(Some(utt)) => utterances.push(utt),
                Ok(None) => {}
                Err(e) => warn!(
                    session_id = %self.session_id,
                    stream_role = %self.stream_role,
                    error = %e,
                    "windowed replay pass failed for one window, continuing"
                ),
            }

            if end == pcm.len() {
                break;
            }
            offset += hop_bytes;
        }

        Ok(utterances)
    }

    /// Send one window of audio over its own connection and return the
    /// last final result, if any.
    async fn run_one_shot_window(
        &self,
        window: &[u8],
        window_start_ms: i64,
    ) -> Result<Option<EmittedUtterance>, AsrError> {
        let (ws_stream, _resp) = tokio_tungstenite::connect_async(&self.upstream_url)
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let task_id = uuid::Uuid::new_v4().to_string();
        let run_task = RunTask::new(task_id, self.model.clone(), database::chunk_store::SAMPLE_RATE_HZ);
        let run_task_json = serde_json::to_string(&run_task)
            .map_err(|e| AsrError::Protocol(format!("failed to encode run-task: {e}")))?;
        write
            .send(Message::Text(run_task_json))
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;
        write
            .send(Message::Binary(window.to_vec()))
            .await
            .map_err(|e| AsrError::Unreachable(e.to_string()))?;

        let mut best: Option<EmittedUtterance> = None;
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| AsrError::Unreachable(e.to_string()))?;
            let Message::Text(text) = msg else { continue };
            let Ok(event) = serde_json::from_str::<UpstreamEvent>(&text) else {
                continue;
            };
            match event {
                UpstreamEvent::ResultGenerated(result) if result.is_final_marker() => {
                    best = Some(EmittedUtterance {
                        session_id: self.session_id.clone(),
                        stream_role: self.stream_role,
                        text: result.text,
                        start_ms: window_start_ms + result.offset_ms,
                        end_ms: window_start_ms + result.offset_ms + result.duration_ms.max(0),
                    });
                }
                UpstreamEvent::TaskFinished => break,
                UpstreamEvent::TaskFailed { code, message } => {
                    return Err(AsrError::Protocol(format!("{code}: {message}")));
                }
                _ => {}
            }
        }
        let _ = write.send(Message::Close(None)).await;
        Ok(best)
    }

    async fn persist_percentiles(&self) {
        let (p50, p95) = {
            let hist = self.latency.lock().expect("latency histogram poisoned");
            (hist.percentile(0.5), hist.percentile(0.95))
        };
        let session_id = self.session_id.clone();
        let role = self.stream_role;
        let result = self
            .store
            .update(
                &session_id,
                Box::new(move |doc| {
                    let entry = doc.asr_by_stream.entry(role).or_default();
                    entry.p50_ms = p50;
                    entry.p95_ms = p95;
                    entry.last_emit_at = Some(now_ms());
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.session_id, error = %e, "failed to persist asr latency percentiles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_queue_drops_oldest_at_capacity() {
        let mut q = SendQueue::new(2);
        assert_eq!(q.push(QueuedChunk { seq: 1, ingest_ts_ms: 0, bytes: vec![] }), None);
        assert_eq!(q.push(QueuedChunk { seq: 2, ingest_ts_ms: 0, bytes: vec![] }), None);
        assert_eq!(q.push(QueuedChunk { seq: 3, ingest_ts_ms: 0, bytes: vec![] }), Some(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().seq, 2);
    }

    #[test]
    fn backoff_schedule_matches_spec() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(5));
        assert_eq!(backoff_for_attempt(99), Duration::from_secs(5));
    }

    #[test]
    fn latency_histogram_computes_percentiles() {
        let mut hist = LatencyHistogram::new();
        for ms in [10.0, 20.0, 30.0, 40.0, 50.0] {
            hist.record(ms);
        }
        assert_eq!(hist.percentile(0.5), Some(30.0));
    }

    #[test]
    fn latency_histogram_caps_sample_count() {
        let mut hist = LatencyHistogram::new();
        for i in 0..(LATENCY_SAMPLE_CAP + 10) {
            hist.record(i as f64);
        }
        assert_eq!(hist.samples.len(), LATENCY_SAMPLE_CAP);
    }
}
