//! Event bus trait — durable, ordered, consumer-group stream semantics.
//!
//! The bus decouples user-facing write latency from downstream fan-out.
//! Records are delivered at-least-once per consumer group: a record not
//! acknowledged within the visibility window is handed to the next reader
//! in the same group.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::BusError;

/// A record as handed to a consumer.
#[derive(Debug, Clone)]
pub struct BusRecord {
    /// Server-assigned monotonic id within the topic.
    pub id: u64,
    /// Type tag, e.g. the dotted domain event kind.
    pub record_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Emission timestamp (unix millis).
    pub emitted_at_ms: i64,
}

/// Durable, append-only, totally-ordered per-topic stream with consumer
/// groups. Implementations must preserve append order within a topic and
/// bound stream length with oldest-first trimming.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append a record; returns the assigned monotonic id.
    async fn publish(
        &self,
        topic: &str,
        record_type: &str,
        payload: Value,
    ) -> Result<u64, BusError>;

    /// Read up to `max` records for `group`, making them invisible to other
    /// consumers in the group for `visibility`. Returns immediately with an
    /// empty vec when nothing is available.
    async fn read(
        &self,
        topic: &str,
        group: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<BusRecord>, BusError>;

    /// Acknowledge a record for `group`; it will not be redelivered.
    async fn ack(&self, topic: &str, group: &str, id: u64) -> Result<(), BusError>;

    /// Wait until at least one record may be available for `group`, or the
    /// timeout elapses. A wakeup is a hint, not a guarantee.
    async fn wait(&self, topic: &str, timeout: Duration);

    /// Number of records currently retained in the topic.
    async fn len(&self, topic: &str) -> usize;
}
