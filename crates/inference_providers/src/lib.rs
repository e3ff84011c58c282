//! Inference Client (spec §4.3): the failover + circuit-breaker HTTP
//! client fronting `extract_embedding`, `score`, `resolve`, `enroll` and
//! the `analysis/*` report-synthesis endpoints.
//!
//! Model inference itself (embedding extraction, name extraction
//! scoring, report synthesis) is out of scope (spec §1) — this crate
//! only speaks the RPC contract.

pub mod auth;
pub mod client;
pub mod models;

pub use client::{Endpoint, InferenceClient, InferenceError};
pub use models::*;
