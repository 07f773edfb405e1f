//! `tmi serve` — start the server and all background workers.
//!
//! Wiring order: bus → store (with change notifier) → services → workers →
//! gateway. Shutdown is a fan-out: ctrl-c flips a watch channel, the
//! gateway drains sessions, and every worker loop exits after finishing
//! its in-flight record.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::info;

use tmi_addons::{AddonService, AddonWorker, InvocationSweeper};
use tmi_authz::{AuthzResolver, IdentityCache};
use tmi_bus::InMemoryBus;
use tmi_collab::SessionRegistry;
use tmi_config::AppConfig;
use tmi_core::quota::RateWindow;
use tmi_core::store::DomainStore;
use tmi_gateway::{AppState, StaticTokenVerifier};
use tmi_security::SecretsManager;
use tmi_store::sqlite::PoolOptions;
use tmi_store::{ChangeNotifier, SqliteStore};
use tmi_webhooks::{
    ChallengeWorker, CleanupWorker, DeliveryWorker, EventConsumer, SubscriptionService,
};

/// Addon dispatch queue depth.
const ADDON_QUEUE: usize = 256;

pub async fn run(port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let secrets = match &config.secrets.encryption_key {
        Some(key) => {
            let mut manager = SecretsManager::new(key);
            if let Some(previous) = &config.secrets.previous_key {
                manager = manager.with_previous(previous);
            }
            Some(Arc::new(manager))
        }
        None => {
            tracing::warn!("No encryption key configured; webhook secrets stored in plaintext");
            None
        }
    };

    // Bus and store
    let bus = Arc::new(InMemoryBus::new(config.bus.max_len));
    let store: Arc<dyn DomainStore> = Arc::new(
        SqliteStore::new(
            &config.database.url,
            PoolOptions {
                max_connections: config.database.max_connections,
                min_connections: config.database.min_connections,
                max_lifetime: Duration::from_secs(config.database.max_lifetime_secs),
            },
        )
        .await
        .context("opening domain store")?
        .with_notifier(ChangeNotifier::new(bus.clone())),
    );

    // Services
    let authz = Arc::new(AuthzResolver::new(store.clone()));
    let identity_cache = Arc::new(IdentityCache::default());
    let verifier = Arc::new(StaticTokenVerifier::from_config(&config.auth));
    let sessions = Arc::new(SessionRegistry::new(config.collab.clone(), store.clone()));
    let subscriptions = Arc::new(SubscriptionService::new(
        store.clone(),
        secrets.clone(),
        config.webhooks.clone(),
        config.quotas,
    ));
    let (addon_tx, addon_rx) = mpsc::channel(ADDON_QUEUE);
    let addons = Arc::new(AddonService::new(
        store.clone(),
        secrets.clone(),
        config.quotas,
        addon_tx,
    ));

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = EventConsumer::new(bus.clone(), store.clone(), config.bus.clone());
    tokio::spawn(consumer.run(shutdown_rx.clone()));

    let challenge = ChallengeWorker::new(store.clone(), secrets.clone(), config.webhooks.clone());
    tokio::spawn(challenge.run(shutdown_rx.clone()));

    let events_window = Arc::new(RateWindow::new(Duration::from_secs(60)));
    for worker_id in 0..config.webhooks.deliverer_pool {
        let deliverer = DeliveryWorker::new(
            store.clone(),
            secrets.clone(),
            config.webhooks.clone(),
            config.quotas,
            events_window.clone(),
        );
        tokio::spawn(deliverer.run(worker_id, shutdown_rx.clone()));
    }

    let cleanup = CleanupWorker::new(store.clone(), config.webhooks.clone());
    tokio::spawn(cleanup.run(shutdown_rx.clone()));

    let addon_queue = Arc::new(Mutex::new(addon_rx));
    for worker_id in 0..config.addons.worker_pool {
        let worker = AddonWorker::new(
            store.clone(),
            secrets.clone(),
            config.addons.clone(),
            addon_queue.clone(),
        );
        tokio::spawn(worker.run(worker_id, shutdown_rx.clone()));
    }
    let sweeper = InvocationSweeper::new(store.clone(), config.addons.clone());
    tokio::spawn(sweeper.run(shutdown_rx.clone()));

    // Gateway
    let state = Arc::new(AppState {
        config,
        store,
        authz,
        identity_cache,
        verifier,
        sessions,
        subscriptions,
        addons,
    });

    // Ctrl-c fans out the shutdown
    let shutdown_trigger = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_trigger.send(true);
        }
    });

    tmi_gateway::serve(state, shutdown_rx).await.context("serving")?;

    // Give worker loops a moment to observe the flag and drain
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Server stopped");
    Ok(())
}
