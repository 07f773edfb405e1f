//! Domain store backends for TMI.
//!
//! Two implementations of [`tmi_core::store::DomainStore`]:
//! - [`SqliteStore`] — WAL-mode SQLite via sqlx, the production default
//! - [`InMemoryStore`] — HashMap-backed, for tests and ephemeral runs
//!
//! Both emit change records through a [`ChangeNotifier`] after commit:
//! at-least-once into the bus, duplicates possible on crash between commit
//! and publish, tolerated downstream by `event_id` dedup.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;
use tracing::warn;

use tmi_core::bus::EventBus;
use tmi_core::event::{ChangeRecord, DOMAIN_TOPIC};

/// Publishes change records to the domain topic after commits.
///
/// Publish failures are logged, never propagated: the commit already
/// happened and the bus is at-least-once, not exactly-once.
#[derive(Clone)]
pub struct ChangeNotifier {
    bus: Arc<dyn EventBus>,
}

impl ChangeNotifier {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub async fn emit(&self, record: ChangeRecord) {
        let kind = record.event_kind.clone();
        let payload = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, event_kind = %kind, "Failed to serialize change record");
                return;
            }
        };
        if let Err(e) = self.bus.publish(DOMAIN_TOPIC, &kind, payload).await {
            warn!(error = %e, event_kind = %kind, "Failed to publish change record");
        }
    }
}
