//! Session Orchestrator (spec §4.9).
//!
//! Per session, owns one ASR driver per stream role and the finalizer
//! task; the Ingest Gateway connection handlers are owned by the `api`
//! crate (their lifetime is bound to the client WebSocket), but read
//! their ASR driver handle and freeze flag through here. Grounded on the
//! teacher's pattern of a `DashMap`-backed registry keyed by id with a
//! `CancellationToken` per entry (`realtime::mod` keeps an analogous
//! per-connection registry).

use crate::asr::{AsrDriver, EmittedUtterance};
use crate::finalize::{self, AsrControl, FinalizeCtx, FinalizeError};
use crate::reconcile::ReconcileService;
use crate::resolver::ResolverService;
use async_trait::async_trait;
use config::CoreConfig;
use database::{ChunkStoreTrait, SessionStoreTrait};
use dashmap::DashMap;
use domain::model::StreamRole;
use domain::resolver::ResolverThresholds;
use inference_providers::InferenceClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One stream role's live driver plus the freeze flag the Ingest Gateway
/// consults before forwarding a chunk to it (spec §4.8 stage 1: ingest
/// keeps ACKing, the driver just stops being fed).
struct StreamHandle {
    driver: Arc<AsrDriver>,
    frozen: Arc<AtomicBool>,
}

struct SessionHandle {
    cancel: CancellationToken,
    streams: std::collections::HashMap<StreamRole, StreamHandle>,
}

pub struct SessionOrchestrator {
    store: Arc<dyn SessionStoreTrait>,
    chunk_store: Arc<dyn ChunkStoreTrait>,
    inference: Arc<InferenceClient>,
    resolver: Arc<ResolverService>,
    reconcile: Arc<ReconcileService>,
    config: Arc<CoreConfig>,
    sessions: DashMap<String, SessionHandle>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStoreTrait>,
        chunk_store: Arc<dyn ChunkStoreTrait>,
        inference: Arc<InferenceClient>,
        config: Arc<CoreConfig>,
    ) -> Self {
        let resolver = Arc::new(ResolverService::new(
            inference.clone(),
            chunk_store.clone(),
            store.clone(),
            ResolverThresholds::default(),
        ));
        let reconcile = Arc::new(ReconcileService::new(store.clone(), chunk_store.clone()));
        Self {
            store,
            chunk_store,
            inference,
            resolver,
            reconcile,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> Arc<ResolverService> {
        self.resolver.clone()
    }

    pub fn reconcile(&self) -> Arc<ReconcileService> {
        self.reconcile.clone()
    }

    pub fn inference(&self) -> Arc<InferenceClient> {
        self.inference.clone()
    }

    pub fn store(&self) -> Arc<dyn SessionStoreTrait> {
        self.store.clone()
    }

    pub fn chunk_store(&self) -> Arc<dyn ChunkStoreTrait> {
        self.chunk_store.clone()
    }

    /// Cancellation token scoping every task belonging to `session_id`
    /// (Design Note §9: "session owns drivers by identifier").
    fn session_cancel(&self, session_id: &str) -> CancellationToken {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHandle {
                cancel: CancellationToken::new(),
                streams: std::collections::HashMap::new(),
            })
            .cancel
            .clone()
    }

    /// Get the driver for `(session_id, role)`, starting it (and its
    /// background `run()` task) on first use.
    pub fn driver_for(&self, session_id: &str, role: StreamRole) -> Arc<AsrDriver> {
        if let Some(entry) = self.sessions.get(session_id) {
            if let Some(stream) = entry.streams.get(&role) {
                return stream.driver.clone();
            }
        }

        let cancel = self.session_cancel(session_id);
        let driver = Arc::new(AsrDriver::new(
            session_id.to_string(),
            role,
            self.config.asr.model.clone(),
            self.config.asr.upstream_url.clone(),
            self.config.asr.send_queue_cap,
            self.store.clone(),
            self.chunk_store.clone(),
            cancel.clone(),
        ));
        let frozen = Arc::new(AtomicBool::new(false));

        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHandle {
                cancel: cancel.clone(),
                streams: std::collections::HashMap::new(),
            });
        let handle = entry
            .streams
            .entry(role)
            .or_insert_with(|| StreamHandle {
                driver: driver.clone(),
                frozen: frozen.clone(),
            });
        let driver = handle.driver.clone();

        let (tx, mut rx) = mpsc::channel::<EmittedUtterance>(64);
        let spawned = driver.clone();
        tokio::spawn(async move {
            spawned.run(tx).await;
        });

        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            while let Some(utt) = rx.recv().await {
                let result = match utt.stream_role {
                    StreamRole::Teacher => {
                        resolver
                            .resolve_teacher(&utt.session_id, utt.text, utt.start_ms, utt.end_ms)
                            .await
                    }
                    StreamRole::Students => {
                        resolver
                            .resolve_students(&utt.session_id, utt.text, utt.start_ms, utt.end_ms)
                            .await
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(session_id = %utt.session_id, error = %e, "failed to persist resolved utterance");
                }
            }
        });

        info!(session_id, stream_role = %role, "started asr driver");
        driver
    }

    pub fn is_frozen(&self, session_id: &str, role: StreamRole) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.streams.get(&role).map(|s| s.frozen.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    /// Cancel every task for `session_id` (client WebSocket close or
    /// session teardown — Design Note §9 "cancellation plumbing").
    pub fn cancel_session(&self, session_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(session_id) {
            handle.cancel.cancel();
        }
    }

    fn finalize_ctx(self: &Arc<Self>) -> FinalizeCtx {
        FinalizeCtx {
            store: self.store.clone(),
            chunk_store: self.chunk_store.clone(),
            inference: self.inference.clone(),
            reconcile: self.reconcile.clone(),
            resolver: self.resolver.clone(),
            asr: self.clone() as Arc<dyn AsrControl>,
            config: self.config.clone(),
        }
    }

    /// Run the finalize pipeline for `session_id` (spec §4.9: "at most
    /// one finalizer per session" — enforced by `finalize::finalize`'s own
    /// resume-from-`finalize.stage` logic, which skips completed stages
    /// rather than re-running the whole pipeline on retry).
    pub async fn finalize(self: &Arc<Self>, session_id: &str) -> Result<u8, FinalizeError> {
        let ctx = self.finalize_ctx();
        finalize::finalize(&ctx, session_id).await
    }
}

#[async_trait]
impl AsrControl for SessionOrchestrator {
    async fn freeze(&self, session_id: &str, role: StreamRole) {
        if let Some(entry) = self.sessions.get(session_id) {
            if let Some(stream) = entry.streams.get(&role) {
                stream.frozen.store(true, Ordering::SeqCst);
                debug!(session_id, stream_role = %role, "froze asr driver ingest for finalize stage 1");
            }
        }
    }

    async fn backlog_chunks(&self, session_id: &str, role: StreamRole) -> u64 {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.streams.get(&role).map(|s| s.driver.backlog_len() as u64))
            .unwrap_or(0)
    }

    async fn replay(
        &self,
        session_id: &str,
        role: StreamRole,
        from_seq: u64,
        to_seq: u64,
        window_ms: i64,
        hop_ms: i64,
    ) -> Result<Vec<EmittedUtterance>, crate::asr::AsrError> {
        let driver = self.driver_for(session_id, role);
        driver.replay_window(from_seq, to_seq, window_ms, hop_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::{InMemoryChunkStore, InMemorySessionStore};

    fn test_config() -> Arc<CoreConfig> {
        Arc::new(CoreConfig {
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
            inference: config::InferenceConfig {
                primary_url: "http://localhost:9000".to_string(),
                secondary_url: None,
                timeout_ms: 1000,
                retry_max: 1,
                retry_backoff_ms: 10,
                circuit_open_ms: 1000,
                failover_enabled: false,
                api_key: None,
            },
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
            finalize: config::FinalizeConfig {
                v2_enabled: false,
                drain_timeout_secs: 1,
            },
            worker_api_key: "secret".to_string(),
            logging: config::LoggingConfig::default(),
        })
    }

    #[tokio::test]
    async fn freezing_an_unstarted_stream_is_a_noop() {
        let orch = Arc::new(SessionOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryChunkStore::new()),
            Arc::new(InferenceClient::new(test_config().inference.clone())),
            test_config(),
        ));
        orch.freeze("s1", StreamRole::Teacher).await;
        assert!(!orch.is_frozen("s1", StreamRole::Teacher));
    }

    #[tokio::test]
    async fn backlog_is_zero_for_unknown_session() {
        let orch = Arc::new(SessionOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryChunkStore::new()),
            Arc::new(InferenceClient::new(test_config().inference.clone())),
            test_config(),
        ));
        assert_eq!(orch.backlog_chunks("ghost", StreamRole::Students).await, 0);
    }
}
