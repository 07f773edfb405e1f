//! `tmi migrate` — bootstrap or upgrade the database schema.

use std::time::Duration;
use anyhow::Context;

use tmi_config::AppConfig;
use tmi_store::SqliteStore;
use tmi_store::sqlite::PoolOptions;

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    println!("Applying schema to {}", config.database.url);

    SqliteStore::new(
        &config.database.url,
        PoolOptions {
            max_connections: config.database.max_connections,
            min_connections: config.database.min_connections,
            max_lifetime: Duration::from_secs(config.database.max_lifetime_secs),
        },
    )
    .await
    .context("running migrations")?;

    println!("Schema is up to date.");
    Ok(())
}
