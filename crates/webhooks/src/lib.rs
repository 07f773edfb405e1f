//! # TMI Webhook Subsystem
//!
//! Challenge-verified subscriptions, change-event fan-out, and
//! at-least-once delivery with retry/backoff:
//!
//! - [`denylist`] — SSRF vetting of target URLs
//! - [`subscriptions`] — lifecycle and per-owner quotas
//! - [`challenge`] — the verification worker
//! - [`consumer`] — domain-event consumer creating delivery rows
//! - [`deliverer`] — the signing delivery worker pool
//! - [`cleanup`] — retention sweeper

pub mod challenge;
pub mod cleanup;
pub mod consumer;
pub mod deliverer;
pub mod denylist;
pub mod subscriptions;

pub use challenge::ChallengeWorker;
pub use cleanup::CleanupWorker;
pub use consumer::EventConsumer;
pub use deliverer::{DeliveryWorker, backoff_with_jitter};
pub use subscriptions::{NewSubscription, SubscriptionService};
