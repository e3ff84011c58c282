//! `GET /v1/audio/ws/{session_id}/{stream_role}` (spec §6 "Client ↔ Ingest
//! Gateway").
//!
//! Grounded directly on the teacher's `routes::realtime::realtime_handler`
//! / `handle_realtime_socket` split: axum extracts and upgrades here, the
//! frame protocol itself is decoded and handled by `services::ingest`
//! (SPEC_FULL §4.7 "api extracts + on_upgrade, business logic behind a
//! trait").

use crate::middleware::auth::check_worker_api_key;
use crate::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use domain::model::StreamRole;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use services::ingest::ClientFrame;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct AudioWsQuery {
    api_key: String,
}

/// WebSocket close code for an auth failure (spec §7 "Auth: close
/// WebSocket with code 1008").
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for a resource failure (spec §7 "Resource: ...
/// close WebSocket with 1011").
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    Path((session_id, stream_role)): Path<(String, StreamRole)>,
    Query(query): Query<AudioWsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !check_worker_api_key(&state.config, &query.api_key) {
        warn!(session_id = %session_id, "rejected ingest websocket: bad api_key");
        return ws.on_upgrade(move |socket| async move {
            close_socket(socket, CLOSE_POLICY_VIOLATION, "bad or missing api_key").await;
        });
    }

    ws.on_upgrade(move |socket| handle_audio_socket(socket, state, session_id, stream_role))
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn close_sink(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
) {
    let _ = sender
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_audio_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    stream_role: StreamRole,
) {
    let (mut sender, mut receiver) = socket.split();
    info!(session_id = %session_id, stream_role = %stream_role, "ingest websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "ingest websocket receive error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame: Result<ClientFrame, _> = serde_json::from_str(&text);
                match frame {
                    Ok(frame) => {
                        match state.ingest.handle_frame(&session_id, frame).await {
                            Ok(Some(reply)) => {
                                if send_frame(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                use services::ingest::ServerFrame;
                                warn!(session_id = %session_id, error = %e, "ingest frame handling error");
                                // Resource failures close the connection (spec §7); everything
                                // else is a client-protocol error: reply and keep going.
                                if matches!(
                                    e,
                                    services::ingest::IngestError::Store(_)
                                        | services::ingest::IngestError::Blob(_)
                                ) {
                                    close_sink(&mut sender, CLOSE_INTERNAL_ERROR, "store unavailable").await;
                                    return;
                                }
                                let error_frame = ServerFrame::Error {
                                    code: e.code().to_string(),
                                    message: e.to_string(),
                                };
                                if send_frame(&mut sender, &error_frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "invalid ingest frame");
                        use services::ingest::ServerFrame;
                        let error_frame = ServerFrame::Error {
                            code: "malformed_frame".to_string(),
                            message: e.to_string(),
                        };
                        if send_frame(&mut sender, &error_frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => {
                info!(session_id = %session_id, stream_role = %stream_role, "ingest websocket closed by client");
                break;
            }
            Message::Ping(data) => {
                let _ = sender.send(Message::Pong(data)).await;
            }
            Message::Pong(_) | Message::Binary(_) => {
                // Audio is carried as base64 inside `chunk` text frames (spec §6);
                // raw binary frames aren't part of this protocol.
            }
        }
    }

    info!(session_id = %session_id, stream_role = %stream_role, "ingest websocket session ended");
}

async fn send_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &services::ingest::ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(json.into())).await
}
