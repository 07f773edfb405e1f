//! Session registry — one live session per diagram.
//!
//! The registry spawns session actors, hands out join handles, and fans
//! out termination on shutdown. Dead sessions are reaped lazily: a handle
//! whose inbound channel is closed is replaced on the next start call and
//! skipped by listings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use tmi_config::CollabConfig;
use tmi_core::error::{CollabError, Error};
use tmi_core::session::{Participant, SessionDescriptor};
use tmi_core::store::DomainStore;

use crate::actor::{Inbound, SessionActor};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::SessionState;

/// Handle to a running session actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub diagram_id: Uuid,
    pub threat_model_id: Uuid,
    tx: mpsc::Sender<Inbound>,
}

impl SessionHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Current descriptor, or `None` when the session already ended.
    pub async fn describe(&self) -> Option<SessionDescriptor> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Inbound::Describe { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Ask the actor to persist now (host-initiated explicit save).
    pub async fn save(&self, requested_by: Uuid) -> Result<(), Error> {
        self.tx
            .send(Inbound::Save { requested_by })
            .await
            .map_err(|_| Error::Collab(CollabError::Closed("session ended".into())))
    }

    pub async fn terminate(&self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Inbound::Terminate {
                reason: reason.into(),
            })
            .await;
    }
}

/// A joined connection: the pipe pair for one WebSocket.
#[derive(Debug)]
pub struct JoinedSession {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    /// Server frames to forward onto the socket. When this closes without
    /// a prior `session_closing` frame, close the socket with
    /// `policy_violation` (backpressure drop).
    pub outbound: mpsc::Receiver<ServerMessage>,
    tx: mpsc::Sender<Inbound>,
}

impl JoinedSession {
    /// Forward a client frame into the session queue.
    ///
    /// Backpressure: a full inbound queue is an error and the caller must
    /// drop the offending connection.
    pub fn send_frame(&self, message: ClientMessage) -> Result<(), CollabError> {
        self.tx
            .try_send(Inbound::Frame {
                connection_id: self.connection_id,
                message,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CollabError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    CollabError::Closed("session ended".into())
                }
            })
    }

    /// Announce departure. Safe to call on an already-ended session.
    pub async fn leave(&self) {
        let _ = self
            .tx
            .send(Inbound::Leave {
                connection_id: self.connection_id,
            })
            .await;
    }
}

/// Registry of live sessions, keyed by diagram.
pub struct SessionRegistry {
    config: CollabConfig,
    store: Arc<dyn DomainStore>,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    /// Diagrams soft-locked for maintenance: session start and join are
    /// rejected until unlocked.
    locked: RwLock<HashSet<Uuid>>,
}

impl SessionRegistry {
    pub fn new(config: CollabConfig, store: Arc<dyn DomainStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
            locked: RwLock::new(HashSet::new()),
        }
    }

    /// Soft-lock a diagram for maintenance, terminating any live session.
    pub async fn lock_for_maintenance(&self, diagram_id: Uuid) {
        self.locked.write().await.insert(diagram_id);
        self.terminate(diagram_id, "diagram locked for maintenance")
            .await;
    }

    pub async fn unlock(&self, diagram_id: Uuid) {
        self.locked.write().await.remove(&diagram_id);
    }

    pub async fn is_locked(&self, diagram_id: Uuid) -> bool {
        self.locked.read().await.contains(&diagram_id)
    }

    /// Start a session for the diagram, or return the existing one.
    pub async fn start_or_get(&self, diagram_id: Uuid) -> Result<SessionHandle, Error> {
        if self.is_locked(diagram_id).await {
            return Err(Error::Collab(CollabError::DiagramLocked));
        }
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&diagram_id)
                && !handle.is_closed()
            {
                return Ok(handle.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&diagram_id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }

        let diagram = self.store.diagram(diagram_id).await.map_err(Error::Store)?;
        let session_id = Uuid::new_v4();
        let websocket_url = format!(
            "/threat_models/{}/diagrams/{}/ws",
            diagram.threat_model_id, diagram.id
        );
        let state = SessionState::from_diagram(session_id, &diagram, self.config.processed_op_cap);
        let (tx, rx) = mpsc::channel(self.config.inbound_queue);
        let actor = SessionActor::new(
            state,
            self.config.clone(),
            self.store.clone(),
            rx,
            websocket_url,
        );
        tokio::spawn(actor.run());

        let handle = SessionHandle {
            session_id,
            diagram_id,
            threat_model_id: diagram.threat_model_id,
            tx,
        };
        sessions.insert(diagram_id, handle.clone());
        info!(session_id = %session_id, diagram_id = %diagram_id, "Session registered");
        Ok(handle)
    }

    /// The live session for a diagram, if any.
    pub async fn get(&self, diagram_id: Uuid) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&diagram_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Join a session with a resolved participant.
    pub async fn join(
        &self,
        handle: &SessionHandle,
        participant: Participant,
    ) -> Result<JoinedSession, Error> {
        if self.is_locked(handle.diagram_id).await {
            return Err(Error::Collab(CollabError::DiagramLocked));
        }
        let connection_id = participant.connection_id;
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue);
        let (ack, ack_rx) = oneshot::channel();
        handle
            .tx
            .send(Inbound::Join {
                participant,
                outbound: out_tx,
                ack,
            })
            .await
            .map_err(|_| Error::Collab(CollabError::Closed("session ended".into())))?;
        ack_rx
            .await
            .map_err(|_| Error::Collab(CollabError::Closed("session ended".into())))?
            .map_err(Error::Collab)?;
        Ok(JoinedSession {
            connection_id,
            session_id: handle.session_id,
            outbound: out_rx,
            tx: handle.tx.clone(),
        })
    }

    /// Descriptors of all live sessions (authorization filtering is the
    /// caller's job).
    pub async fn list(&self) -> Vec<SessionDescriptor> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().filter(|h| !h.is_closed()).cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(descriptor) = handle.describe().await {
                out.push(descriptor);
            }
        }
        out
    }

    /// Admin termination of a diagram's session.
    pub async fn terminate(&self, diagram_id: Uuid, reason: &str) -> bool {
        let handle = { self.sessions.read().await.get(&diagram_id).cloned() };
        match handle {
            Some(handle) if !handle.is_closed() => {
                handle.terminate(reason).await;
                true
            }
            _ => false,
        }
    }

    /// Process shutdown: terminate every session, then wait (bounded) for
    /// the actors to persist and exit.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        for handle in &handles {
            handle.terminate("server shutting down").await;
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        for handle in &handles {
            while !handle.is_closed() {
                if tokio::time::Instant::now() >= deadline {
                    warn!(session_id = %handle.session_id, "Session did not drain within grace");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}
