//! Addon worker: queued invocations → signed POSTs to the addon webhook.
//!
//! The request body carries the target reference, the caller payload, and
//! the `callback_url` the receiver must use to report progress. Expiry:
//! a non-terminal invocation older than the configured lifetime is failed
//! by the sweeper, and records past retention are pruned.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use tmi_config::AddonConfig;
use tmi_core::addon::InvocationStatus;
use tmi_core::store::DomainStore;
use tmi_security::SecretsManager;
use tmi_security::signature::{SIGNATURE_HEADER, signature_header};

pub struct AddonWorker {
    store: Arc<dyn DomainStore>,
    secrets: Option<Arc<SecretsManager>>,
    config: AddonConfig,
    client: reqwest::Client,
    queue: Arc<Mutex<mpsc::Receiver<Uuid>>>,
}

impl AddonWorker {
    pub fn new(
        store: Arc<dyn DomainStore>,
        secrets: Option<Arc<SecretsManager>>,
        config: AddonConfig,
        queue: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            store,
            secrets,
            config,
            client,
            queue,
        }
    }

    /// Consume queued invocations until shutdown.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Addon worker started");
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = queue.recv() => next,
                }
            };
            match next {
                Some(invocation_id) => self.dispatch(invocation_id).await,
                None => break,
            }
        }
        info!(worker_id, "Addon worker stopped");
    }

    /// POST one invocation to its addon's webhook.
    pub async fn dispatch(&self, invocation_id: Uuid) {
        let invocation = match self.store.invocation(invocation_id).await {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(error = %e, invocation_id = %invocation_id, "Invocation lookup failed");
                return;
            }
        };
        if invocation.status != InvocationStatus::Pending {
            return;
        }
        let addon = match self.store.addon(invocation.addon_id).await {
            Ok(addon) => addon,
            Err(e) => {
                warn!(error = %e, "Addon lookup failed");
                let _ = self
                    .store
                    .update_invocation_status(
                        invocation_id,
                        InvocationStatus::Failed,
                        100,
                        "addon deleted",
                    )
                    .await;
                return;
            }
        };
        let webhook = match self.store.subscription(addon.webhook_id).await {
            Ok(webhook) => webhook,
            Err(e) => {
                warn!(error = %e, "Webhook lookup failed");
                let _ = self
                    .store
                    .update_invocation_status(
                        invocation_id,
                        InvocationStatus::Failed,
                        100,
                        "webhook deleted",
                    )
                    .await;
                return;
            }
        };

        let secret = match &self.secrets {
            Some(secrets) if SecretsManager::is_envelope(&webhook.secret) => {
                match secrets.decrypt(&webhook.secret) {
                    Ok(secret) => secret,
                    Err(e) => {
                        warn!(error = %e, "Cannot decrypt webhook secret");
                        return;
                    }
                }
            }
            _ => webhook.secret.clone(),
        };

        let callback_url = format!(
            "{}/invocations/{}/status",
            self.config.public_base_url.trim_end_matches('/'),
            invocation.id
        );
        let body = json!({
            "invocation_id": invocation.id,
            "addon_id": addon.id,
            "target_object_kind": invocation.target_object_kind,
            "target_object_id": invocation.target_object_id,
            "payload": invocation.payload,
            "callback_url": callback_url,
        })
        .to_string();

        let response = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", "addon.invoked")
            .header("X-Invocation-Id", invocation.id.to_string())
            .header("X-Addon-Id", addon.id.to_string())
            .header(SIGNATURE_HEADER, signature_header(&secret, body.as_bytes()))
            .header("User-Agent", "TMI-Webhook-Worker/1.0")
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(invocation_id = %invocation.id, "Invocation dispatched");
            }
            Ok(resp) => {
                warn!(invocation_id = %invocation.id, status = %resp.status(), "Addon endpoint refused");
                let _ = self
                    .store
                    .update_invocation_status(
                        invocation.id,
                        InvocationStatus::Failed,
                        100,
                        &format!("endpoint returned {}", resp.status()),
                    )
                    .await;
            }
            Err(e) => {
                warn!(invocation_id = %invocation.id, error = %e, "Addon dispatch failed");
                let _ = self
                    .store
                    .update_invocation_status(
                        invocation.id,
                        InvocationStatus::Failed,
                        100,
                        "dispatch failed",
                    )
                    .await;
            }
        }
    }
}

/// Expiry + retention sweeper for invocation records.
pub struct InvocationSweeper {
    store: Arc<dyn DomainStore>,
    config: AddonConfig,
}

impl InvocationSweeper {
    pub fn new(store: Arc<dyn DomainStore>, config: AddonConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Invocation sweeper started");
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.pass().await;
                }
            }
        }
        info!("Invocation sweeper stopped");
    }

    pub async fn pass(&self) {
        let now = Utc::now();

        let lifetime = chrono::Duration::minutes(self.config.callback_lifetime_minutes as i64);
        match self.store.expire_invocations(now - lifetime).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "Expired stale invocations"),
            Err(e) => warn!(error = %e, "Invocation expiry failed"),
        }

        let retention = chrono::Duration::days(self.config.invocation_retention_days as i64);
        match self.store.prune_invocations(now - retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned invocation records"),
            Err(e) => warn!(error = %e, "Invocation prune failed"),
        }
    }
}
