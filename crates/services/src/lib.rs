//! Service layer for the edge session core: the ASR Driver (§4.4), the
//! async Speaker Resolver wrapper (§4.5), the Reconciler materialization
//! (§4.6), the Ingest Gateway logic (§4.7), the Finalizer (§4.8), and the
//! Session Orchestrator (§4.9) that wires them together per session.
//!
//! Follows the teacher's split between `services` (business logic behind
//! traits/free functions) and `api` (axum extraction, routing).

pub mod asr;
pub mod finalize;
pub mod ingest;
pub mod orchestrator;
pub mod reconcile;
pub mod resolver;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Centralized so every timestamp in
/// the service layer goes through one call site.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
