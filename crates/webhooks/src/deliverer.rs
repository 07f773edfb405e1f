//! Delivery worker: pending/retry rows → signed HTTP POSTs.
//!
//! Workers claim due deliveries and POST the stored canonical JSON body.
//! HTTP 2xx is terminal success; 410 disables the subscription permanently;
//! anything else schedules a retry with capped exponential backoff and
//! jitter until `max_attempts`, after which the delivery is failed and the
//! subscription's failure count advances (crossing the threshold disables
//! it). Per-owner events-per-minute caps defer excess work to the next
//! window without consuming attempts.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tmi_config::WebhookConfig;
use tmi_core::error::StoreError;
use tmi_core::quota::{Quota, RateWindow};
use tmi_core::store::DomainStore;
use tmi_core::webhook::{DeliveryStatus, SubscriptionStatus, WebhookDelivery};
use tmi_security::SecretsManager;
use tmi_security::signature::{SIGNATURE_HEADER, signature_header};

/// Claim batch size per pass.
const CLAIM_BATCH: usize = 16;

pub struct DeliveryWorker {
    store: Arc<dyn DomainStore>,
    secrets: Option<Arc<SecretsManager>>,
    config: WebhookConfig,
    default_quota: Quota,
    client: reqwest::Client,
    /// Shared across the pool so the per-owner cap is global.
    events_window: Arc<RateWindow>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn DomainStore>,
        secrets: Option<Arc<SecretsManager>>,
        config: WebhookConfig,
        default_quota: Quota,
        events_window: Arc<RateWindow>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self {
            store,
            secrets,
            config,
            default_quota,
            client,
            events_window,
        }
    }

    /// Process deliveries until shutdown.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Delivery worker started");
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.pass().await;
                }
            }
        }
        info!(worker_id, "Delivery worker stopped");
    }

    /// Claim and attempt one batch. Per-record errors never crash the
    /// worker.
    pub async fn pass(&self) {
        let claimed = match self.store.claim_due_deliveries(Utc::now(), CLAIM_BATCH).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(error = %e, "Delivery claim failed");
                return;
            }
        };
        for delivery in claimed {
            self.attempt(delivery).await;
        }
    }

    async fn attempt(&self, delivery: WebhookDelivery) {
        let sub = match self.store.subscription(delivery.subscription_id).await {
            Ok(sub) => sub,
            Err(StoreError::NotFound { .. }) => {
                // Orphaned: the cleanup sweeper will remove it; close it out
                let _ = self
                    .store
                    .mark_delivery(
                        delivery.id,
                        DeliveryStatus::Failed,
                        delivery.attempts,
                        None,
                        Some("subscription deleted"),
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, delivery_id = %delivery.id, "Subscription lookup failed");
                let _ = self
                    .store
                    .mark_delivery(
                        delivery.id,
                        DeliveryStatus::Retry,
                        delivery.attempts,
                        Some(Utc::now() + chrono::Duration::seconds(5)),
                        Some("store unavailable"),
                    )
                    .await;
                return;
            }
        };

        if sub.status != SubscriptionStatus::Active {
            let _ = self
                .store
                .mark_delivery(
                    delivery.id,
                    DeliveryStatus::Failed,
                    delivery.attempts,
                    None,
                    Some("subscription not active"),
                )
                .await;
            return;
        }

        // Owner events-per-minute cap: defer, attempts untouched
        let quota = self
            .store
            .quota_override(sub.owner_user_uuid)
            .await
            .ok()
            .flatten()
            .unwrap_or(self.default_quota);
        let owner_key = sub.owner_user_uuid.to_string();
        if !self
            .events_window
            .try_acquire(&owner_key, quota.events_per_minute)
        {
            let defer = self.events_window.retry_after_secs(&owner_key);
            debug!(delivery_id = %delivery.id, defer_secs = defer, "Owner event cap; deferring");
            let _ = self
                .store
                .mark_delivery(
                    delivery.id,
                    DeliveryStatus::Retry,
                    delivery.attempts,
                    Some(Utc::now() + chrono::Duration::seconds(defer as i64)),
                    Some("events_per_minute deferred"),
                )
                .await;
            return;
        }

        let secret = match self.plaintext_secret(&sub) {
            Some(secret) => secret,
            None => {
                let _ = self
                    .store
                    .mark_delivery(
                        delivery.id,
                        DeliveryStatus::Failed,
                        delivery.attempts,
                        None,
                        Some("secret unavailable"),
                    )
                    .await;
                return;
            }
        };

        // The stored payload bytes are the exact signed and sent body
        let body = delivery.payload.clone();
        let response = self
            .client
            .post(&sub.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", delivery.event_kind.as_str())
            .header(SIGNATURE_HEADER, signature_header(&secret, body.as_bytes()))
            .header("User-Agent", "TMI-Webhook-Worker/1.0")
            .body(body)
            .send()
            .await;

        let attempts = delivery.attempts + 1;
        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(delivery_id = %delivery.id, "Delivered");
                let _ = self
                    .store
                    .mark_delivery(delivery.id, DeliveryStatus::Delivered, attempts, None, None)
                    .await;
                let _ = self.store.record_successful_use(sub.id).await;
            }
            Ok(resp) if resp.status().as_u16() == 410 => {
                info!(subscription_id = %sub.id, "Endpoint gone; disabling subscription");
                let _ = self
                    .store
                    .mark_delivery(
                        delivery.id,
                        DeliveryStatus::Failed,
                        attempts,
                        None,
                        Some("endpoint gone (410)"),
                    )
                    .await;
                let _ = self
                    .store
                    .set_subscription_status(sub.id, SubscriptionStatus::Disabled)
                    .await;
            }
            Ok(resp) => {
                self.handle_failure(&delivery, &sub.id, attempts, &format!("HTTP {}", resp.status()))
                    .await;
            }
            Err(e) => {
                self.handle_failure(&delivery, &sub.id, attempts, &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_failure(
        &self,
        delivery: &WebhookDelivery,
        subscription_id: &uuid::Uuid,
        attempts: u32,
        error: &str,
    ) {
        if attempts >= self.config.max_attempts {
            warn!(delivery_id = %delivery.id, attempts, error, "Delivery attempts exhausted");
            let _ = self
                .store
                .mark_delivery(delivery.id, DeliveryStatus::Failed, attempts, None, Some(error))
                .await;
            match self.store.record_publication_failure(*subscription_id).await {
                Ok(failures) if failures >= self.config.auto_disable_failures => {
                    warn!(
                        subscription_id = %subscription_id,
                        failures,
                        "Failure threshold crossed; disabling subscription"
                    );
                    let _ = self
                        .store
                        .set_subscription_status(*subscription_id, SubscriptionStatus::Disabled)
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to record publication failure"),
            }
        } else {
            let delay = backoff_with_jitter(
                attempts,
                self.config.backoff_base_secs,
                self.config.backoff_cap_secs,
            );
            debug!(delivery_id = %delivery.id, attempts, delay_secs = delay, error, "Retry scheduled");
            let _ = self
                .store
                .mark_delivery(
                    delivery.id,
                    DeliveryStatus::Retry,
                    attempts,
                    Some(Utc::now() + chrono::Duration::seconds(delay as i64)),
                    Some(error),
                )
                .await;
        }
    }

    fn plaintext_secret(&self, sub: &tmi_core::webhook::WebhookSubscription) -> Option<String> {
        match &self.secrets {
            Some(secrets) if SecretsManager::is_envelope(&sub.secret) => {
                secrets.decrypt(&sub.secret).ok()
            }
            _ => Some(sub.secret.clone()),
        }
    }
}

/// Exponential backoff with jitter, capped.
pub fn backoff_with_jitter(attempts: u32, base_secs: u64, cap_secs: u64) -> u64 {
    use rand::Rng;
    let exp = base_secs.saturating_mul(1u64 << attempts.saturating_sub(1).min(20));
    let capped = exp.min(cap_secs);
    let jitter = rand::rng().random_range(0..=base_secs.max(1));
    (capped + jitter).min(cap_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;
    use tmi_core::webhook::WebhookSubscription;
    use tmi_store::InMemoryStore;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(String, String)>>>,
        respond_status: Arc<Mutex<u16>>,
    }

    async fn capture_handler(
        State(state): State<Captured>,
        headers: HeaderMap,
        body: String,
    ) -> (axum::http::StatusCode, Json<serde_json::Value>) {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.requests.lock().unwrap().push((signature, body));
        let status = *state.respond_status.lock().unwrap();
        (
            axum::http::StatusCode::from_u16(status).unwrap(),
            Json(serde_json::json!({})),
        )
    }

    async fn spawn_endpoint(state: Captured) -> String {
        let app = Router::new()
            .route("/hook", post(capture_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    async fn seed(
        store: &InMemoryStore,
        url: &str,
        secret: &str,
    ) -> (WebhookSubscription, WebhookDelivery) {
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: None,
            url: url.into(),
            secret: secret.into(),
            events: vec!["threat_model.updated".into()],
            status: SubscriptionStatus::Active,
            challenge: String::new(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        store.create_subscription(&sub).await.unwrap();

        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: sub.id,
            event_id: Uuid::new_v4(),
            event_kind: "threat_model.updated".into(),
            payload: r#"{"event":"threat_model.updated","n":1}"#.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_delivery(&delivery).await.unwrap();
        (sub, delivery)
    }

    fn worker(store: Arc<InMemoryStore>, config: WebhookConfig) -> DeliveryWorker {
        DeliveryWorker::new(
            store,
            None,
            config,
            Quota::default(),
            Arc::new(RateWindow::new(Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn successful_delivery_is_signed_over_exact_bytes() {
        let captured = Captured::default();
        *captured.respond_status.lock().unwrap() = 200;
        let url = spawn_endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let (sub, delivery) = seed(&store, &url, "s3cret").await;

        worker(store.clone(), WebhookConfig::default()).pass().await;

        let requests = captured.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let (signature, body) = &requests[0];
        // HMAC of the exact received bytes matches the header
        assert!(tmi_security::verify_signature("s3cret", body.as_bytes(), signature));
        assert_eq!(body, &delivery.payload);

        let stored = store.delivery(delivery.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempts, 1);
        let sub = store.subscription(sub.id).await.unwrap();
        assert!(sub.last_successful_use.is_some());
    }

    #[tokio::test]
    async fn http_410_disables_subscription() {
        let captured = Captured::default();
        *captured.respond_status.lock().unwrap() = 410;
        let url = spawn_endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let (sub, delivery) = seed(&store, &url, "s").await;

        worker(store.clone(), WebhookConfig::default()).pass().await;

        assert_eq!(
            store.delivery(delivery.id).await.unwrap().status,
            DeliveryStatus::Failed
        );
        assert_eq!(
            store.subscription(sub.id).await.unwrap().status,
            SubscriptionStatus::Disabled
        );
    }

    #[tokio::test]
    async fn server_error_schedules_retry_with_backoff() {
        let captured = Captured::default();
        *captured.respond_status.lock().unwrap() = 503;
        let url = spawn_endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let (_, delivery) = seed(&store, &url, "s").await;

        worker(store.clone(), WebhookConfig::default()).pass().await;

        let stored = store.delivery(delivery.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Retry);
        assert_eq!(stored.attempts, 1);
        let next = stored.next_retry_at.expect("retry scheduled");
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn attempts_exhaustion_fails_and_counts_against_subscription() {
        let captured = Captured::default();
        *captured.respond_status.lock().unwrap() = 500;
        let url = spawn_endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let config = WebhookConfig {
            max_attempts: 1,
            auto_disable_failures: 2,
            ..WebhookConfig::default()
        };
        let (sub, delivery) = seed(&store, &url, "s").await;

        worker(store.clone(), config.clone()).pass().await;

        assert_eq!(
            store.delivery(delivery.id).await.unwrap().status,
            DeliveryStatus::Failed
        );
        let loaded = store.subscription(sub.id).await.unwrap();
        assert_eq!(loaded.publication_failures, 1);
        assert_eq!(loaded.status, SubscriptionStatus::Active);

        // A second exhausted delivery crosses the threshold
        let now = Utc::now();
        let second = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: sub.id,
            event_id: Uuid::new_v4(),
            event_kind: "threat_model.updated".into(),
            payload: "{}".into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_delivery(&second).await.unwrap();
        worker(store.clone(), config).pass().await;

        assert_eq!(
            store.subscription(sub.id).await.unwrap().status,
            SubscriptionStatus::Disabled
        );
    }

    #[tokio::test]
    async fn owner_event_cap_defers_without_consuming_attempts() {
        let captured = Captured::default();
        *captured.respond_status.lock().unwrap() = 200;
        let url = spawn_endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let (sub, delivery) = seed(&store, &url, "s").await;
        store
            .set_quota_override(
                sub.owner_user_uuid,
                &Quota {
                    events_per_minute: 0,
                    ..Quota::default()
                },
            )
            .await
            .unwrap();

        worker(store.clone(), WebhookConfig::default()).pass().await;

        let stored = store.delivery(delivery.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Retry);
        assert_eq!(stored.attempts, 0);
        assert!(captured.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        for _ in 0..20 {
            let d1 = backoff_with_jitter(1, 5, 3600);
            let d4 = backoff_with_jitter(4, 5, 3600);
            assert!(d1 <= 10);
            assert!((40..=45).contains(&d4));
            assert!(backoff_with_jitter(30, 5, 3600) <= 3600);
        }
    }
}
