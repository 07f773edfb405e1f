//! Retention sweeper for delivery records.
//!
//! Terminal deliveries older than the retention window are removed;
//! deliveries whose subscription was deleted are removed immediately.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use tmi_config::WebhookConfig;
use tmi_core::store::DomainStore;

pub struct CleanupWorker {
    store: Arc<dyn DomainStore>,
    config: WebhookConfig,
}

impl CleanupWorker {
    pub fn new(store: Arc<dyn DomainStore>, config: WebhookConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Delivery cleanup worker started");
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.pass().await;
                }
            }
        }
        info!("Delivery cleanup worker stopped");
    }

    pub async fn pass(&self) {
        let cutoff =
            Utc::now() - chrono::Duration::days(self.config.delivery_retention_days as i64);
        match self.store.prune_deliveries(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned delivery records"),
            Err(e) => warn!(error = %e, "Delivery prune failed"),
        }
    }
}
