//! # TMI Core
//!
//! Domain types, traits, and error definitions for the TMI collaboration
//! server. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is defined as a trait here. Implementations live in
//! their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with in-memory implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod addon;
pub mod bus;
pub mod diagram;
pub mod error;
pub mod event;
pub mod identity;
pub mod model;
pub mod quota;
pub mod session;
pub mod store;
pub mod webhook;

// Re-export key types at crate root for ergonomics
pub use addon::{AddonInvocation, AddonRegistration, InvocationStatus};
pub use bus::{BusRecord, EventBus};
pub use diagram::{Cell, CellBody, Diagram, DiagramKind, Geometry, Point};
pub use error::{Error, ErrorKind, Result};
pub use event::{ChangeAction, ChangeRecord, DOMAIN_TOPIC};
pub use identity::{GroupRef, Principal, Role, User};
pub use model::{Grant, ObjectKind, ResourceRef, Subresource, SubresourcePayload, ThreatModel};
pub use quota::{Quota, RateWindow};
pub use session::{CellOp, CellPatch, DiagramOperation, Participant, RejectReason, SessionDescriptor};
pub use store::DomainStore;
pub use webhook::{DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription};
