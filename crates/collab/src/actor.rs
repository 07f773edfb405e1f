//! The per-session serial processor.
//!
//! Exactly one task owns each session. All inbound traffic lands on a
//! bounded mpsc queue and is consumed in FIFO order; the task is the sole
//! mutator of session state, which yields sequential consistency within a
//! session without locks. Outbound frames go through bounded per-connection
//! queues; a connection whose queue overflows is dropped (the WebSocket
//! layer closes it with `policy_violation`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tmi_config::CollabConfig;
use tmi_core::diagram::Point;
use tmi_core::error::{CollabError, StoreError};
use tmi_core::session::{Participant, SessionDescriptor};
use tmi_core::store::DomainStore;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{ApplyResult, SessionState};

/// Messages accepted by a session actor.
pub enum Inbound {
    Join {
        participant: Participant,
        outbound: mpsc::Sender<ServerMessage>,
        ack: oneshot::Sender<Result<(), CollabError>>,
    },
    Frame {
        connection_id: Uuid,
        message: ClientMessage,
    },
    Leave {
        connection_id: Uuid,
    },
    /// Explicit save; honored only from the host.
    Save {
        requested_by: Uuid,
    },
    Describe {
        reply: oneshot::Sender<SessionDescriptor>,
    },
    Terminate {
        reason: String,
    },
}

struct Connection {
    user_uuid: Uuid,
    tx: mpsc::Sender<ServerMessage>,
}

/// One session's owning task.
pub struct SessionActor {
    state: SessionState,
    config: CollabConfig,
    store: Arc<dyn DomainStore>,
    rx: mpsc::Receiver<Inbound>,
    connections: HashMap<Uuid, Connection>,
    pending_cursors: HashMap<Uuid, Point>,
    /// Connections whose outbound queue overflowed or closed; reaped after
    /// the current message is fully handled.
    overflowed: Vec<Uuid>,
    websocket_url: String,
    idle_warned: bool,
}

impl SessionActor {
    pub fn new(
        state: SessionState,
        config: CollabConfig,
        store: Arc<dyn DomainStore>,
        rx: mpsc::Receiver<Inbound>,
        websocket_url: String,
    ) -> Self {
        Self {
            state,
            config,
            store,
            rx,
            connections: HashMap::new(),
            pending_cursors: HashMap::new(),
            overflowed: Vec::new(),
            websocket_url,
            idle_warned: false,
        }
    }

    /// Drive the session until it ends.
    pub async fn run(mut self) {
        let session_id = self.state.session_id;
        info!(session_id = %session_id, diagram_id = %self.state.diagram_id, "Session started");

        let mut cursor_tick =
            tokio::time::interval(Duration::from_millis(self.config.cursor_coalesce_ms.max(1)));
        cursor_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut idle_tick = tokio::time::interval(Duration::from_secs(30));
        idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let mut ended = false;
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(Inbound::Join { participant, outbound, ack }) => {
                            let result = self.handle_join(participant, outbound);
                            let _ = ack.send(result);
                        }
                        Some(Inbound::Frame { connection_id, message }) => {
                            self.handle_frame(connection_id, message).await;
                        }
                        Some(Inbound::Leave { connection_id }) => {
                            ended = self.remove_connection(connection_id);
                        }
                        Some(Inbound::Save { requested_by }) => {
                            if requested_by == self.state.host {
                                self.persist().await;
                            }
                        }
                        Some(Inbound::Describe { reply }) => {
                            let _ = reply.send(self.state.descriptor(self.websocket_url.clone()));
                        }
                        Some(Inbound::Terminate { reason }) => {
                            self.broadcast(ServerMessage::SessionClosing { reason });
                            ended = true;
                        }
                        None => ended = true,
                    }
                }
                _ = cursor_tick.tick() => {
                    self.flush_cursors();
                }
                _ = idle_tick.tick() => {
                    ended = self.check_idle();
                }
            }

            // Backpressure drops happen outside the send path so membership
            // events triggered by a drop cannot recurse into it.
            if self.reap_overflowed() {
                ended = true;
            }
            if ended {
                break;
            }
        }

        self.shutdown().await;
        info!(session_id = %session_id, "Session ended");
    }

    fn handle_join(
        &mut self,
        participant: Participant,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<(), CollabError> {
        // Reconnect: replace any existing connection for the same user
        if let Some(old_conn) = self
            .connections
            .iter()
            .find(|(_, c)| c.user_uuid == participant.user_uuid)
            .map(|(id, _)| *id)
        {
            debug!(user = %participant.user_uuid, "Replacing stale connection on rejoin");
            let outcome = self.state.remove_participant(old_conn);
            self.connections.remove(&old_conn);
            for event in outcome.events {
                self.broadcast(event);
            }
        }

        if self.state.participants().len() >= self.config.max_participants {
            return Err(CollabError::SessionFull(self.config.max_participants));
        }

        let joined = self.state.add_participant(participant);
        self.connections.insert(
            joined.connection_id,
            Connection {
                user_uuid: joined.user_uuid,
                tx: outbound,
            },
        );

        // The joiner gets the authoritative state; everyone else learns
        // about the new participant.
        self.send_to_connection(joined.connection_id, self.state.correction_full());
        let note = ServerMessage::ParticipantJoined {
            participant: joined.clone(),
        };
        let others: Vec<Uuid> = self
            .connections
            .keys()
            .copied()
            .filter(|id| *id != joined.connection_id)
            .collect();
        for conn_id in others {
            self.send_to_connection(conn_id, note.clone());
        }
        Ok(())
    }

    async fn handle_frame(&mut self, connection_id: Uuid, message: ClientMessage) {
        let Some(participant) = self.state.participant_by_connection(connection_id).cloned()
        else {
            debug!(connection_id = %connection_id, "Frame from unknown connection");
            return;
        };

        match message {
            ClientMessage::Operation { operation } => {
                let result = self.state.apply_operation(
                    participant.user_uuid,
                    participant.role_at_session_start,
                    operation,
                    self.config.stale_tolerance,
                );
                match result {
                    ApplyResult::Applied(applied) => {
                        self.broadcast(applied);
                        self.idle_warned = false;
                        if self.config.checkpoint_every > 0
                            && self.state.dirty_ops >= self.config.checkpoint_every
                        {
                            self.persist().await;
                        }
                    }
                    ApplyResult::Rejected(rejection) => {
                        let correction = match &rejection {
                            ServerMessage::OperationRejected {
                                requires_resync: true,
                                affected_cells,
                                ..
                            } => Some(self.state.correction_for(affected_cells)),
                            _ => None,
                        };
                        self.send_to_connection(connection_id, rejection);
                        if let Some(correction) = correction {
                            self.send_to_connection(connection_id, correction);
                        }
                    }
                    ApplyResult::Duplicate(prior) => {
                        self.send_to_connection(connection_id, prior);
                    }
                }
            }
            ClientMessage::PresenterRequest => {
                for event in self.state.request_presenter(participant.user_uuid) {
                    self.broadcast(event);
                }
            }
            ClientMessage::PresenterYield => {
                for event in self.state.yield_presenter(participant.user_uuid) {
                    self.broadcast(event);
                }
            }
            ClientMessage::Cursor { position } => {
                // Coalesced: only the latest per user within the window
                self.pending_cursors.insert(participant.user_uuid, position);
            }
            ClientMessage::Ping => {
                self.send_to_connection(connection_id, ServerMessage::Pong);
            }
        }
    }

    /// Remove a connection and its participant. Returns true when the
    /// session must end.
    fn remove_connection(&mut self, connection_id: Uuid) -> bool {
        let outcome = self.state.remove_participant(connection_id);
        self.connections.remove(&connection_id);
        if outcome.left.is_none() {
            return false;
        }
        for event in outcome.events {
            self.broadcast(event);
        }
        outcome.ended
    }

    /// Drop connections whose queue overflowed, broadcasting the resulting
    /// membership events. Returns true when the session must end.
    fn reap_overflowed(&mut self) -> bool {
        let mut ended = false;
        while let Some(conn_id) = self.overflowed.pop() {
            if self.connections.contains_key(&conn_id) && self.remove_connection(conn_id) {
                ended = true;
            }
        }
        ended
    }

    fn flush_cursors(&mut self) {
        if self.pending_cursors.is_empty() {
            return;
        }
        let cursors: Vec<(Uuid, Point)> = self.pending_cursors.drain().collect();
        for (user_uuid, position) in cursors {
            let frame = ServerMessage::Cursor {
                user_uuid,
                position,
            };
            let targets: Vec<Uuid> = self
                .connections
                .iter()
                .filter(|(_, c)| c.user_uuid != user_uuid)
                .map(|(id, _)| *id)
                .collect();
            for conn_id in targets {
                self.send_to_connection(conn_id, frame.clone());
            }
        }
    }

    /// Returns true when the idle grace period has fully elapsed.
    fn check_idle(&mut self) -> bool {
        let idle_for = chrono::Utc::now() - self.state.last_activity_at;
        let warn_after = chrono::Duration::minutes(self.config.idle_warning_minutes as i64);
        let grace = chrono::Duration::minutes(self.config.idle_grace_minutes as i64);

        if idle_for >= warn_after + grace {
            warn!(session_id = %self.state.session_id, "Idle session timed out");
            self.broadcast(ServerMessage::SessionClosing {
                reason: "idle timeout".into(),
            });
            return true;
        }
        if idle_for >= warn_after && !self.idle_warned {
            self.idle_warned = true;
            self.broadcast(ServerMessage::IdleWarning {
                grace_secs: self.config.idle_grace_minutes * 60,
            });
        }
        false
    }

    /// Persist the current cell set through the domain store.
    ///
    /// A version conflict means an external edit won: re-read, reset, and
    /// issue a full correction to every participant.
    async fn persist(&mut self) -> bool {
        if self.state.version == self.state.last_persisted_version {
            return true;
        }
        let cells = self.state.cells_snapshot();
        let result = self
            .store
            .update_diagram_cells(
                self.state.diagram_id,
                &cells,
                self.state.last_persisted_version,
                self.state.version,
                self.state.host,
            )
            .await;

        match result {
            Ok(()) => {
                self.state.mark_persisted();
                debug!(
                    session_id = %self.state.session_id,
                    version = self.state.version,
                    "Session state persisted"
                );
                true
            }
            Err(StoreError::VersionConflict { found, .. }) => {
                warn!(
                    session_id = %self.state.session_id,
                    stored_version = found,
                    "External edit detected; resetting session from store"
                );
                match self.store.diagram(self.state.diagram_id).await {
                    Ok(diagram) => {
                        self.state.reset_from_diagram(&diagram);
                        let correction = self.state.correction_full();
                        self.broadcast(correction);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to re-read diagram after conflict");
                    }
                }
                false
            }
            Err(e) => {
                warn!(error = %e, session_id = %self.state.session_id, "Persistence failed");
                false
            }
        }
    }

    /// Final persistence with bounded retries, then connection teardown.
    async fn shutdown(&mut self) {
        let mut attempt = 0u32;
        while self.state.version != self.state.last_persisted_version {
            if self.persist().await {
                break;
            }
            attempt += 1;
            if attempt >= self.config.persist_retry_max {
                error!(
                    session_id = %self.state.session_id,
                    live_version = self.state.version,
                    persisted_version = self.state.last_persisted_version,
                    "Persistence retries exhausted; live state diverges from store"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100 * (1u64 << attempt.min(6)))).await;
        }
        self.connections.clear();
    }

    fn broadcast(&mut self, message: ServerMessage) {
        let conn_ids: Vec<Uuid> = self.connections.keys().copied().collect();
        for conn_id in conn_ids {
            self.send_to_connection(conn_id, message.clone());
        }
    }

    /// Queue a frame. Overflow marks the connection for backpressure drop.
    fn send_to_connection(&mut self, connection_id: Uuid, message: ServerMessage) {
        let Some(conn) = self.connections.get(&connection_id) else {
            return;
        };
        match conn.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "Outbound queue overflow; dropping connection");
                self.overflowed.push(connection_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.overflowed.push(connection_id);
            }
        }
    }
}
