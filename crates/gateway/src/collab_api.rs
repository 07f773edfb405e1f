//! Collaboration REST + WebSocket surface.
//!
//! `POST …/collaborate` starts (or returns) the diagram's session and
//! hands back the descriptor with the WebSocket path. The upgrade route
//! re-authenticates and authorizes *before* switching protocols, then
//! bridges socket frames to the session actor's queues.

use axum::{
    Json, Router,
    extract::ws::{CloseCode, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use tmi_collab::protocol::close_code;
use tmi_collab::{ClientMessage, JoinedSession, ServerMessage};
use tmi_core::error::Error;
use tmi_core::identity::Role;
use tmi_core::model::{ObjectKind, ResourceRef};
use tmi_core::session::{Participant, SessionDescriptor};

use crate::{ApiError, AuthedUser, SharedState};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}/collaborate",
            post(start_collaboration),
        )
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}/collaborate",
            delete(terminate_collaboration),
        )
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}/collaborate/save",
            post(save_collaboration),
        )
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}/lock",
            post(lock_diagram),
        )
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}/lock",
            delete(unlock_diagram),
        )
        .route("/collaboration/sessions", get(list_sessions))
        .route("/threat_models/{id}/diagrams/{diagram_id}/ws", get(ws_upgrade))
}

/// `POST …/lock` — soft-lock a diagram for maintenance (admin).
async fn lock_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state.sessions.lock_for_maintenance(diagram_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE …/lock` — lift the maintenance lock (admin).
async fn unlock_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state.sessions.unlock(diagram_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST …/collaborate` — start or return the active session. Idempotent;
/// requires writer-or-better.
async fn start_collaboration(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<SessionDescriptor>), ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;

    let existed = state.sessions.get(diagram_id).await.is_some();
    let handle = state.sessions.start_or_get(diagram_id).await?;
    let descriptor = handle
        .describe()
        .await
        .ok_or_else(|| Error::Internal("session ended during start".into()))?;
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(descriptor)))
}

/// `DELETE …/collaborate` — admin termination of the session.
async fn terminate_collaboration(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    if state
        .sessions
        .terminate(diagram_id, "terminated by administrator")
        .await
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::Collab(tmi_core::error::CollabError::SessionNotFound(
            diagram_id.to_string(),
        ))
        .into())
    }
}

/// `POST …/collaborate/save` — explicit host save of the live state.
async fn save_collaboration(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    let handle = state.sessions.get(diagram_id).await.ok_or_else(|| {
        Error::Collab(tmi_core::error::CollabError::SessionNotFound(
            diagram_id.to_string(),
        ))
    })?;
    handle.save(user.principal.internal_uuid).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /collaboration/sessions` — sessions on resources where the caller
/// holds reader-or-better.
async fn list_sessions(
    State(state): State<SharedState>,
    user: AuthedUser,
) -> Result<Json<Vec<SessionDescriptor>>, ApiError> {
    let all = state.sessions.list().await;
    let mut visible = Vec::new();
    for descriptor in all {
        let allowed = state
            .authz
            .require_role(
                &user.principal,
                ResourceRef::new(ObjectKind::ThreatModel, descriptor.threat_model_id),
                Role::Reader,
            )
            .await
            .is_ok();
        if allowed {
            visible.push(descriptor);
        }
    }
    Ok(Json(visible))
}

/// WebSocket upgrade. Authentication already ran in the middleware (the
/// `token` query param feeds it for browser clients); authorization runs
/// here, before the protocol switch.
async fn ws_upgrade(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let role = state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Reader,
        )
        .await
        .map_err(Error::Auth)?;

    // Join requires an already-started session
    let handle = state.sessions.get(diagram_id).await.ok_or_else(|| {
        Error::Collab(tmi_core::error::CollabError::SessionNotFound(
            diagram_id.to_string(),
        ))
    })?;

    let participant = Participant {
        user_uuid: user.principal.internal_uuid,
        email: user.principal.email.clone(),
        display_name: user.principal.display_name.clone(),
        connection_id: Uuid::new_v4(),
        role_at_session_start: role,
        joined_at: Utc::now(),
        is_host: false,
        is_presenter: false,
    };
    let joined = state.sessions.join(&handle, participant).await?;

    Ok(ws.on_upgrade(move |socket| bridge_connection(socket, joined)))
}

/// Pump frames between the socket and the session actor.
async fn bridge_connection(socket: WebSocket, mut joined: JoinedSession) {
    let (mut sink, mut stream) = socket.split();
    let connection_id = joined.connection_id;
    debug!(connection_id = %connection_id, "WebSocket bridged to session");

    let mut closing_normally = false;
    loop {
        tokio::select! {
            outbound = joined.outbound.recv() => {
                match outbound {
                    Some(frame) => {
                        if matches!(frame, ServerMessage::SessionClosing { .. }) {
                            closing_normally = true;
                        }
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "Frame serialization failed");
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                        if closing_normally {
                            let _ = sink
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: close_code::NORMAL,
                                    reason: "session closed".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    None => {
                        // Outbound dropped without a closing frame: the
                        // actor slow-dropped this connection
                        let code: CloseCode = close_code::POLICY_VIOLATION;
                        let _ = sink
                            .send(WsMessage::Close(Some(CloseFrame {
                                code,
                                reason: "outbound queue overflow".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame: ClientMessage = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(error = %e, "Ignoring malformed client frame");
                                continue;
                            }
                        };
                        if joined.send_frame(frame).is_err() {
                            // Inbound queue full or session gone: slow-drop
                            let _ = sink
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: close_code::POLICY_VIOLATION,
                                    reason: "inbound queue overflow".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // binary/ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    joined.leave().await;
    debug!(connection_id = %connection_id, "WebSocket bridge closed");
}
