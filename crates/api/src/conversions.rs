//! Domain/store/gateway error → HTTP response conversions (spec §7).
//!
//! Grounded on the teacher's `conversions.rs`: `From<DomainError> for
//! ErrorResponse` impls plus a status-code lookup, kept separate so route
//! handlers build `(StatusCode, Json<ErrorResponse>)` the same way
//! `api::routes::realtime` does on its error paths.

use crate::models::ErrorResponse;
use axum::http::StatusCode;
use database::{ChunkStoreError, StoreError};
use inference_providers::InferenceError;
use services::finalize::FinalizeError;
use services::ingest::IngestError;
use services::reconcile::ReconcileError;
use services::resolver::ResolverServiceError;

/// Transient upstream / resource failures map to 503 (spec §7 "Resource");
/// a corrupt session is a 503 too (quarantined, not found).
pub fn store_error_response(err: &StoreError) -> (StatusCode, ErrorResponse) {
    match err {
        StoreError::Unavailable(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new(msg.clone(), "store_unavailable"),
        ),
        StoreError::Corrupt(session_id) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new(format!("session {session_id} is quarantined"), "session_quarantined"),
        ),
        StoreError::Migration(session_id, e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new(format!("session {session_id} migration failed: {e}"), "migration_failed"),
        ),
        StoreError::Rejected(msg) => (
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(msg.clone(), "update_rejected"),
        ),
    }
}

pub fn chunk_store_error_response(err: &ChunkStoreError) -> (StatusCode, ErrorResponse) {
    match err {
        ChunkStoreError::NotFound(key) => (
            StatusCode::NOT_FOUND,
            ErrorResponse::new(format!("not found: {key}"), "not_found"),
        ),
        ChunkStoreError::ConflictingContent { .. } => (
            StatusCode::CONFLICT,
            ErrorResponse::new(err.to_string(), "conflicting_content"),
        ),
        ChunkStoreError::Backend(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new(msg.clone(), "store_unavailable"),
        ),
    }
}

pub fn inference_error_response(err: &InferenceError) -> (StatusCode, ErrorResponse) {
    (
        StatusCode::BAD_GATEWAY,
        ErrorResponse::new(err.to_string(), "upstream_unavailable"),
    )
}

pub fn ingest_error_response(err: &IngestError) -> (StatusCode, ErrorResponse) {
    let status = match err {
        IngestError::SessionFinalized => StatusCode::CONFLICT,
        IngestError::SizeMismatch { .. } | IngestError::Decode(_) => StatusCode::BAD_REQUEST,
        IngestError::Store(_) | IngestError::Blob(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, ErrorResponse::new(err.to_string(), err.code()))
}

pub fn reconcile_error_response(err: &ReconcileError) -> (StatusCode, ErrorResponse) {
    match err {
        ReconcileError::Store(e) => store_error_response(e),
        ReconcileError::Blob(e) => chunk_store_error_response(e),
        ReconcileError::Serialize(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new(e.to_string(), "serialize_failed"),
        ),
    }
}

pub fn resolver_error_response(err: &ResolverServiceError) -> (StatusCode, ErrorResponse) {
    match err {
        ResolverServiceError::Store(e) => store_error_response(e),
        ResolverServiceError::Resolver(e) => (
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(e.to_string(), "unknown_cluster"),
        ),
    }
}

pub fn finalize_error_response(err: &FinalizeError) -> (StatusCode, ErrorResponse) {
    match err {
        FinalizeError::Store(e) => store_error_response(e),
        FinalizeError::Persist(e) => chunk_store_error_response(e),
    }
}
