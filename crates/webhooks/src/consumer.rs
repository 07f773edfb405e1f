//! Domain-event consumer: bus records → delivery rows.
//!
//! A consumer group on the domain topic. Each record fans out to the
//! subscriptions whose `(events, threat_model_id)` filter matches, creating
//! one pending delivery per match, then the record is acknowledged.
//! Duplicate records from at-least-once bus semantics collapse on the
//! `(subscription_id, event_id)` idempotent insert.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmi_config::BusConfig;
use tmi_core::bus::{BusRecord, EventBus};
use tmi_core::event::{ChangeRecord, DOMAIN_TOPIC};
use tmi_core::store::DomainStore;
use tmi_core::webhook::{DeliveryStatus, SubscriptionStatus, WebhookDelivery};

/// Consumer group name on the domain topic.
pub const CONSUMER_GROUP: &str = "webhook-fanout";

pub struct EventConsumer {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn DomainStore>,
    config: BusConfig,
}

impl EventConsumer {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn DomainStore>, config: BusConfig) -> Self {
        Self { bus, store, config }
    }

    /// Consume until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Webhook event consumer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.bus.wait(DOMAIN_TOPIC, Duration::from_secs(1)) => {
                    self.drain().await;
                }
            }
        }
        info!("Webhook event consumer stopped");
    }

    /// Read and process every available record.
    pub async fn drain(&self) {
        loop {
            let batch = match self
                .bus
                .read(DOMAIN_TOPIC, CONSUMER_GROUP, 64, self.config.visibility())
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Bus read failed");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            for record in batch {
                let id = record.id;
                // A poisoned record must not wedge the group: process,
                // log, and ack regardless.
                if let Err(e) = self.process(record).await {
                    warn!(record_id = id, error = %e, "Record fan-out failed");
                }
                if let Err(e) = self.bus.ack(DOMAIN_TOPIC, CONSUMER_GROUP, id).await {
                    debug!(record_id = id, error = %e, "Ack failed");
                }
            }
        }
    }

    async fn process(&self, record: BusRecord) -> Result<(), String> {
        let change: ChangeRecord =
            serde_json::from_value(record.payload).map_err(|e| e.to_string())?;

        let subscriptions = self
            .store
            .subscriptions_with_status(SubscriptionStatus::Active)
            .await
            .map_err(|e| e.to_string())?;

        // The canonical JSON body: serialized once here, signed and sent
        // byte-for-byte by the delivery worker.
        let payload = serde_json::to_string(&change).map_err(|e| e.to_string())?;
        let now = Utc::now();

        for sub in subscriptions {
            if !sub.matches(&change.event_kind, change.threat_model_id) {
                continue;
            }
            let delivery = WebhookDelivery {
                id: Uuid::new_v4(),
                subscription_id: sub.id,
                event_id: change.event_id,
                event_kind: change.event_kind.clone(),
                payload: payload.clone(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                next_retry_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            match self.store.insert_delivery(&delivery).await {
                Ok(true) => {
                    debug!(
                        delivery_id = %delivery.id,
                        subscription_id = %sub.id,
                        event_kind = %change.event_kind,
                        "Delivery queued"
                    );
                }
                Ok(false) => {
                    debug!(
                        subscription_id = %sub.id,
                        event_id = %change.event_id,
                        "Duplicate event dropped"
                    );
                }
                Err(e) => warn!(error = %e, "Delivery insert failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_bus::InMemoryBus;
    use tmi_core::event::ChangeAction;
    use tmi_core::model::ObjectKind;
    use tmi_core::webhook::WebhookSubscription;
    use tmi_store::InMemoryStore;

    async fn active_subscription(
        store: &InMemoryStore,
        events: Vec<String>,
        scope: Option<Uuid>,
    ) -> WebhookSubscription {
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: scope,
            url: "https://example.test/hook".into(),
            secret: "s".into(),
            events,
            status: SubscriptionStatus::Active,
            challenge: String::new(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        store.create_subscription(&sub).await.unwrap();
        sub
    }

    async fn publish_change(bus: &InMemoryBus, tm: Uuid) -> ChangeRecord {
        let change = ChangeRecord::new(
            ObjectKind::ThreatModel,
            ChangeAction::Updated,
            tm,
            Some(tm),
            Uuid::new_v4(),
        );
        bus.publish(
            DOMAIN_TOPIC,
            &change.event_kind,
            serde_json::to_value(&change).unwrap(),
        )
        .await
        .unwrap();
        change
    }

    #[tokio::test]
    async fn matching_subscription_gets_a_delivery() {
        let bus = Arc::new(InMemoryBus::new(100));
        let store = Arc::new(InMemoryStore::new());
        let sub =
            active_subscription(&store, vec!["threat_model.updated".into()], None).await;
        let change = publish_change(&bus, Uuid::new_v4()).await;

        let consumer = EventConsumer::new(bus.clone(), store.clone(), BusConfig::default());
        consumer.drain().await;

        let claimed = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].subscription_id, sub.id);
        assert_eq!(claimed[0].event_id, change.event_id);
        // Payload is the canonical change record
        let parsed: ChangeRecord = serde_json::from_str(&claimed[0].payload).unwrap();
        assert_eq!(parsed.event_id, change.event_id);
    }

    #[tokio::test]
    async fn non_matching_kind_and_scope_are_skipped() {
        let bus = Arc::new(InMemoryBus::new(100));
        let store = Arc::new(InMemoryStore::new());
        active_subscription(&store, vec!["diagram.updated".into()], None).await;
        active_subscription(
            &store,
            vec!["threat_model.updated".into()],
            Some(Uuid::new_v4()),
        )
        .await;
        publish_change(&bus, Uuid::new_v4()).await;

        let consumer = EventConsumer::new(bus.clone(), store.clone(), BusConfig::default());
        consumer.drain().await;

        assert!(store.claim_due_deliveries(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_bus_records_collapse() {
        let bus = Arc::new(InMemoryBus::new(100));
        let store = Arc::new(InMemoryStore::new());
        active_subscription(&store, vec!["threat_model.updated".into()], None).await;

        let change = publish_change(&bus, Uuid::new_v4()).await;
        // The same logical event lands on the bus twice (crash between
        // commit and publish)
        bus.publish(
            DOMAIN_TOPIC,
            &change.event_kind,
            serde_json::to_value(&change).unwrap(),
        )
        .await
        .unwrap();

        let consumer = EventConsumer::new(bus.clone(), store.clone(), BusConfig::default());
        consumer.drain().await;

        let claimed = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn poisoned_record_is_acked_and_skipped() {
        let bus = Arc::new(InMemoryBus::new(100));
        let store = Arc::new(InMemoryStore::new());
        bus.publish(DOMAIN_TOPIC, "garbage", serde_json::json!("not a change record"))
            .await
            .unwrap();

        let consumer = EventConsumer::new(bus.clone(), store.clone(), BusConfig::default());
        consumer.drain().await;

        // Record was acked despite the parse failure
        let again = bus
            .read(DOMAIN_TOPIC, CONSUMER_GROUP, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(again.is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let redelivered = bus
            .read(DOMAIN_TOPIC, CONSUMER_GROUP, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(redelivered.is_empty());
    }
}
