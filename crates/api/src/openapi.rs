use crate::models::*;
use utoipa::OpenApi;

/// OpenAPI documentation for the edge session core's control plane.
///
/// The audio ingest WebSocket (`/v1/audio/ws/{session_id}/{stream_role}`)
/// has no HTTP response body and isn't representable in OpenAPI, so it's
/// documented in prose rather than a `paths(...)` entry.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Edge Session Core",
        description = "Dual-audio-stream interview transcription: ingest, real-time ASR, speaker resolution, reconciliation and finalization.",
        version = "1.0.0"
    ),
    paths(
        crate::routes::health::health_check,
        crate::routes::control::set_config,
        crate::routes::control::get_state,
        crate::routes::control::get_events,
        crate::routes::control::get_utterances,
        crate::routes::control::finalize_session,
        crate::routes::control::start_enrollment,
        crate::routes::control::stop_enrollment,
        crate::routes::control::get_enrollment_state,
        crate::routes::control::set_cluster_map,
        crate::routes::control::get_unresolved_clusters,
        crate::routes::control::asr_run,
        crate::routes::control::asr_reset,
    ),
    components(schemas(
        ErrorResponse,
        HealthResponse,
        ConfigRequest,
        StateResponse,
        EventsResponse,
        UtterancesResponse,
        FinalizeResponse,
        EnrollmentStartRequest,
        EnrollmentStateResponse,
        ClusterMapRequest,
        UnresolvedClustersResponse,
        AsrRunRequest,
        AsrRunResponse,
        AsrResetRequest,
    )),
    tags(
        (name = "Health", description = "Liveness and backend reachability"),
        (name = "Sessions", description = "Session configuration, state and transcript reads"),
        (name = "Enrollment", description = "Voice enrollment window control"),
        (name = "Resolution", description = "Cluster-to-speaker binding"),
        (name = "Admin", description = "Worker-key-gated replay tools"),
    )
)]
pub struct ApiDoc;
