//! # TMI Collaboration Engine
//!
//! Per-diagram real-time editing sessions: membership, presenter/host
//! control, authoritative operation ordering, optimistic-concurrency
//! rejection with state correction, and fan-out to participant
//! connections.
//!
//! Structure:
//! - [`protocol`] — the JSON WebSocket frame types and close codes
//! - [`state`] — pure session state and the acceptance algorithm
//! - [`actor`] — the serial processor owning one session
//! - [`registry`] — diagram → session mapping and shutdown fan-out

pub mod actor;
pub mod protocol;
pub mod registry;
pub mod state;

pub use protocol::{ClientMessage, ServerMessage, close_code};
pub use registry::{JoinedSession, SessionHandle, SessionRegistry};
pub use state::{ApplyResult, SessionState};
