//! Control-plane endpoints under `/v1/sessions/{id}/...` (spec §6).
//!
//! Every handler follows the same shape the teacher's `routes::responses`
//! module does: extract, call one service method, map the `Result`
//! through `conversions.rs`. The admin-only replay endpoints
//! (`asr-run`, `asr-reset`) sit behind [`crate::middleware::auth::worker_key_middleware`]
//! at the router layer, not inline in the handler.

use crate::conversions::{finalize_error_response, ingest_error_response, store_error_response};
use crate::models::{
    AsrResetRequest, AsrRunRequest, AsrRunResponse, ClusterMapRequest, ConfigRequest,
    EnrollmentStartRequest, EnrollmentStateResponse, ErrorResponse, EventsQuery, EventsResponse,
    FinalizeResponse, StateResponse, UnresolvedClustersResponse, UtterancesQuery,
    UtterancesResponse,
};
use crate::routes::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json as ResponseJson;
use domain::model::{Event, SessionConfig};
use domain::resolver::validate_cluster_map;
use services::ingest::ClientFrame;
use services::reconcile::TranscriptView;

type ApiResult<T> = Result<(StatusCode, ResponseJson<T>), (StatusCode, ResponseJson<ErrorResponse>)>;

fn err(pair: (StatusCode, ErrorResponse)) -> (StatusCode, ResponseJson<ErrorResponse>) {
    (pair.0, ResponseJson(pair.1))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/config",
    params(("session_id" = String, Path)),
    request_body = ConfigRequest,
    responses((status = 200, description = "Config applied", body = StateResponse)),
    tag = "Sessions"
)]
pub async fn set_config(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<ConfigRequest>,
) -> ApiResult<StateResponse> {
    let store = state.orchestrator.store();
    let doc = store
        .update(
            &session_id,
            Box::new(move |doc| {
                let mut config = SessionConfig {
                    mode: body.mode.unwrap_or(doc.config.mode),
                    roster: if body.roster.is_empty() {
                        doc.config.roster.clone()
                    } else {
                        body.roster
                    },
                    interviewer_name: body
                        .interviewer_name
                        .unwrap_or_else(|| doc.config.interviewer_name.clone()),
                    participant_priority: body
                        .participant_priority
                        .or_else(|| doc.config.participant_priority.clone()),
                    stage_names: body.stage_names.unwrap_or_else(|| doc.config.stage_names.clone()),
                    dimension_rubric: body
                        .dimension_rubric
                        .unwrap_or_else(|| doc.config.dimension_rubric.clone()),
                    notes: body.notes.or_else(|| doc.config.notes.clone()),
                    tags: body.tags.unwrap_or_else(|| doc.config.tags.clone()),
                };
                std::mem::swap(&mut doc.config, &mut config);
                Ok(())
            }),
        )
        .await
        .map_err(|e| err(store_error_response(&e)))?;

    Ok((StatusCode::OK, ResponseJson(StateResponse { session: doc })))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/state",
    params(("session_id" = String, Path)),
    responses((status = 200, description = "Full session document", body = StateResponse)),
    tag = "Sessions"
)]
pub async fn get_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StateResponse> {
    let doc = state
        .orchestrator
        .store()
        .get_or_create(&session_id)
        .await
        .map_err(|e| err(store_error_response(&e)))?;
    Ok((StatusCode::OK, ResponseJson(StateResponse { session: doc })))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events",
    params(("session_id" = String, Path), ("limit" = Option<usize>, Query)),
    responses((status = 200, description = "Session event log", body = EventsResponse)),
    tag = "Sessions"
)]
pub async fn get_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<EventsResponse> {
    let doc = state
        .orchestrator
        .store()
        .get_or_create(&session_id)
        .await
        .map_err(|e| err(store_error_response(&e)))?;

    let mut events: Vec<Event> = doc.events;
    if let Some(limit) = query.limit {
        if events.len() > limit {
            let drop = events.len() - limit;
            events.drain(0..drop);
        }
    }
    Ok((StatusCode::OK, ResponseJson(EventsResponse { events })))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/utterances",
    params(
        ("session_id" = String, Path),
        ("stream_role" = Option<String>, Query),
        ("view" = Option<String>, Query),
        ("limit" = Option<usize>, Query),
    ),
    responses((status = 200, description = "Utterances", body = UtterancesResponse)),
    tag = "Sessions"
)]
pub async fn get_utterances(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<UtterancesQuery>,
) -> ApiResult<UtterancesResponse> {
    let view = match query.view.as_deref() {
        Some("raw") => TranscriptView::Raw,
        _ => TranscriptView::Merged,
    };

    let mut utterances = state
        .orchestrator
        .reconcile()
        .transcript(&session_id, view)
        .await
        .map_err(|e| err(store_error_response(&e)))?;

    if let Some(role) = query.stream_role {
        utterances.retain(|u| u.stream_role == role);
    }
    if let Some(limit) = query.limit {
        if utterances.len() > limit {
            let drop = utterances.len() - limit;
            utterances.drain(0..drop);
        }
    }

    Ok((StatusCode::OK, ResponseJson(UtterancesResponse { utterances })))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/finalize",
    params(("session_id" = String, Path)),
    responses((status = 200, description = "Finalization stage reached", body = FinalizeResponse)),
    tag = "Sessions"
)]
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<FinalizeResponse> {
    let stage = state
        .orchestrator
        .finalize(&session_id)
        .await
        .map_err(|e| err(finalize_error_response(&e)))?;
    Ok((StatusCode::OK, ResponseJson(FinalizeResponse { stage })))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/enrollment/start",
    params(("session_id" = String, Path)),
    request_body = EnrollmentStartRequest,
    responses((status = 200, description = "Enrollment window opened")),
    tag = "Enrollment"
)]
pub async fn start_enrollment(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<EnrollmentStartRequest>,
) -> Result<StatusCode, (StatusCode, ResponseJson<ErrorResponse>)> {
    let frame = ClientFrame::Enrollment {
        stream_role: domain::model::StreamRole::Students,
        participant_name: body.participant_name,
        start: true,
        stop: false,
    };
    state
        .ingest
        .handle_frame(&session_id, frame)
        .await
        .map_err(|e| err(ingest_error_response(&e)))?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/enrollment/stop",
    params(("session_id" = String, Path)),
    request_body = EnrollmentStartRequest,
    responses((status = 200, description = "Enrollment window closed")),
    tag = "Enrollment"
)]
pub async fn stop_enrollment(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<EnrollmentStartRequest>,
) -> Result<StatusCode, (StatusCode, ResponseJson<ErrorResponse>)> {
    let frame = ClientFrame::Enrollment {
        stream_role: domain::model::StreamRole::Students,
        participant_name: body.participant_name,
        start: false,
        stop: true,
    };
    state
        .ingest
        .handle_frame(&session_id, frame)
        .await
        .map_err(|e| err(ingest_error_response(&e)))?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/enrollment/state",
    params(("session_id" = String, Path)),
    responses((status = 200, description = "Current enrollment state", body = EnrollmentStateResponse)),
    tag = "Enrollment"
)]
pub async fn get_enrollment_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<EnrollmentStateResponse> {
    let doc = state
        .orchestrator
        .store()
        .get_or_create(&session_id)
        .await
        .map_err(|e| err(store_error_response(&e)))?;
    Ok((
        StatusCode::OK,
        ResponseJson(EnrollmentStateResponse { state: doc.enrollment_state }),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/cluster-map",
    params(("session_id" = String, Path)),
    request_body = ClusterMapRequest,
    responses((status = 200, description = "Cluster bound to a name", body = StateResponse)),
    tag = "Resolution"
)]
pub async fn set_cluster_map(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<ClusterMapRequest>,
) -> ApiResult<StateResponse> {
    use domain::model::{BindingMeta, BindingSource, EventPayload};

    let store = state.orchestrator.store();
    let cluster_id = body.cluster_id.clone();
    let name = body.name.clone();
    let locked = body.locked;

    let doc = store
        .update(
            &session_id,
            Box::new(move |doc| {
                validate_cluster_map(&doc.clusters, &cluster_id).map_err(|e| e.to_string())?;
                doc.bindings.insert(cluster_id.clone(), name.clone());
                doc.binding_meta.insert(
                    cluster_id.clone(),
                    BindingMeta {
                        source: BindingSource::ManualMap,
                        confidence: 1.0,
                        locked,
                        updated_at: services::now_ms(),
                    },
                );
                if let Some(cluster) = doc.clusters.iter_mut().find(|c| c.cluster_id == cluster_id) {
                    cluster.bound_name = Some(name.clone());
                }
                doc.push_event(
                    services::now_ms(),
                    EventPayload::ClusterMap { cluster_id: cluster_id.clone(), name: name.clone(), locked },
                );
                Ok(())
            }),
        )
        .await
        .map_err(|e| err(store_error_response(&e)))?;

    Ok((StatusCode::OK, ResponseJson(StateResponse { session: doc })))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/unresolved-clusters",
    params(("session_id" = String, Path)),
    responses((status = 200, description = "Clusters with no bound name", body = UnresolvedClustersResponse)),
    tag = "Resolution"
)]
pub async fn get_unresolved_clusters(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<UnresolvedClustersResponse> {
    let doc = state
        .orchestrator
        .store()
        .get_or_create(&session_id)
        .await
        .map_err(|e| err(store_error_response(&e)))?;

    let clusters = doc
        .clusters
        .into_iter()
        .filter(|c| c.bound_name.is_none())
        .collect();

    Ok((StatusCode::OK, ResponseJson(UnresolvedClustersResponse { clusters })))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/asr-run",
    params(("session_id" = String, Path)),
    request_body = AsrRunRequest,
    responses((status = 200, description = "Windowed replay pass result", body = AsrRunResponse)),
    tag = "Admin"
)]
pub async fn asr_run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<AsrRunRequest>,
) -> ApiResult<AsrRunResponse> {
    let driver = state.orchestrator.driver_for(&session_id, body.stream_role);
    let config = &state.config.asr;
    let window_ms = (config.replay_window_secs * 1000) as i64;
    let hop_ms = (config.replay_hop_secs * 1000) as i64;

    let utterances = driver
        .replay_window(body.from_seq, body.to_seq, window_ms, hop_ms)
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_GATEWAY,
                ResponseJson(ErrorResponse::new(e.to_string(), "asr_replay_failed")),
            )
        })?;

    let resolver = state.orchestrator.resolver();
    for utt in &utterances {
        let result = match utt.stream_role {
            domain::model::StreamRole::Teacher => {
                resolver
                    .resolve_teacher(&utt.session_id, utt.text.clone(), utt.start_ms, utt.end_ms)
                    .await
                    .map_err(resolver_error_response_from_store)
            }
            domain::model::StreamRole::Students => {
                resolver
                    .resolve_students(&utt.session_id, utt.text.clone(), utt.start_ms, utt.end_ms)
                    .await
                    .map_err(resolver_error_response_from_store)
            }
        };
        result.map_err(err)?;
    }

    Ok((
        StatusCode::OK,
        ResponseJson(AsrRunResponse { utterances_emitted: utterances.len() }),
    ))
}

fn resolver_error_response_from_store(
    e: database::StoreError,
) -> (StatusCode, ErrorResponse) {
    store_error_response(&e)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/asr-reset",
    params(("session_id" = String, Path)),
    request_body = AsrResetRequest,
    responses((status = 200, description = "Session ASR drivers reset")),
    tag = "Admin"
)]
pub async fn asr_reset(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::Json(_body): axum::Json<AsrResetRequest>,
) -> StatusCode {
    state.orchestrator.cancel_session(&session_id);
    StatusCode::OK
}

