//! Route handlers (spec §6) plus the shared [`AppState`] every handler
//! extracts, grounded on the teacher's `routes::api::AppState` pattern of
//! a small `Clone`-able struct of `Arc<...>` services.

pub mod audio_ws;
pub mod control;
pub mod health;

use config::CoreConfig;
use services::ingest::IngestGateway;
use services::orchestrator::SessionOrchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub ingest: Arc<IngestGateway>,
    pub config: Arc<CoreConfig>,
}
