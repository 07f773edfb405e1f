//! Challenge verification worker.
//!
//! Sends a signed POST `{challenge, subscription_id}` to each pending
//! subscription's URL on a fixed cadence until the endpoint echoes the
//! challenge (HTTP 200 with the challenge string in the body). On success
//! the subscription becomes `active`; when the attempt cap is exhausted it
//! is disabled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmi_config::WebhookConfig;
use tmi_core::store::DomainStore;
use tmi_core::webhook::{SubscriptionStatus, WebhookSubscription};
use tmi_security::SecretsManager;
use tmi_security::signature::{SIGNATURE_HEADER, signature_header};

/// Event kind carried in challenge POSTs.
pub const CHALLENGE_EVENT: &str = "webhook.challenge";

pub struct ChallengeWorker {
    store: Arc<dyn DomainStore>,
    secrets: Option<Arc<SecretsManager>>,
    config: WebhookConfig,
    client: reqwest::Client,
    last_attempt: HashMap<Uuid, Instant>,
}

impl ChallengeWorker {
    pub fn new(
        store: Arc<dyn DomainStore>,
        secrets: Option<Arc<SecretsManager>>,
        config: WebhookConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self {
            store,
            secrets,
            config,
            client,
            last_attempt: HashMap::new(),
        }
    }

    /// Drive challenge passes until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Challenge worker started");
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.pass().await;
                }
            }
        }
        info!("Challenge worker stopped");
    }

    /// One sweep over pending subscriptions. Per-record failures are
    /// recorded and never crash the worker.
    pub async fn pass(&mut self) {
        let pending = match self
            .store
            .subscriptions_with_status(SubscriptionStatus::PendingVerification)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to list pending subscriptions");
                return;
            }
        };

        let interval = Duration::from_secs(self.config.challenge_interval_secs);
        for sub in pending {
            if let Some(last) = self.last_attempt.get(&sub.id)
                && last.elapsed() < interval
            {
                continue;
            }
            self.last_attempt.insert(sub.id, Instant::now());
            self.attempt(&sub).await;
        }
        self.last_attempt.retain(|_, t| t.elapsed() < interval * 4);
    }

    async fn attempt(&self, sub: &WebhookSubscription) {
        if sub.challenges_sent >= self.config.challenge_cap {
            warn!(subscription_id = %sub.id, "Challenge cap exhausted; disabling");
            let _ = self
                .store
                .set_subscription_status(sub.id, SubscriptionStatus::Disabled)
                .await;
            return;
        }
        if let Err(e) = self.store.record_challenge_sent(sub.id).await {
            warn!(error = %e, subscription_id = %sub.id, "Failed to record challenge attempt");
            return;
        }

        let secret = match self.plaintext_secret(sub) {
            Some(secret) => secret,
            None => return,
        };
        let body = json!({
            "challenge": sub.challenge,
            "subscription_id": sub.id,
        })
        .to_string();

        let response = self
            .client
            .post(&sub.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", CHALLENGE_EVENT)
            .header(SIGNATURE_HEADER, signature_header(&secret, body.as_bytes()))
            .header("User-Agent", "TMI-Webhook-Worker/1.0")
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let echoed = resp.text().await.unwrap_or_default();
                if echoed.contains(&sub.challenge) {
                    info!(subscription_id = %sub.id, "Challenge verified; subscription active");
                    let _ = self
                        .store
                        .set_subscription_status(sub.id, SubscriptionStatus::Active)
                        .await;
                } else {
                    debug!(subscription_id = %sub.id, "Challenge response did not echo nonce");
                }
            }
            Ok(resp) => {
                debug!(subscription_id = %sub.id, status = %resp.status(), "Challenge not accepted");
            }
            Err(e) => {
                debug!(subscription_id = %sub.id, error = %e, "Challenge POST failed");
            }
        }
    }

    fn plaintext_secret(&self, sub: &WebhookSubscription) -> Option<String> {
        match &self.secrets {
            Some(secrets) if SecretsManager::is_envelope(&sub.secret) => {
                match secrets.decrypt(&sub.secret) {
                    Ok(secret) => Some(secret),
                    Err(e) => {
                        warn!(error = %e, subscription_id = %sub.id, "Cannot decrypt secret");
                        None
                    }
                }
            }
            _ => Some(sub.secret.clone()),
        }
    }
}
