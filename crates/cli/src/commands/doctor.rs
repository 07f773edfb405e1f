//! `tmi doctor` — diagnose configuration and storage health.

use std::time::Duration;

use tmi_config::AppConfig;
use tmi_store::SqliteStore;
use tmi_store::sqlite::PoolOptions;

pub async fn run() -> anyhow::Result<()> {
    println!("TMI Doctor — System Diagnostics");
    println!("===============================\n");

    let mut issues = 0;

    // Check config
    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            Some(config)
        }
        Err(e) => {
            println!("  ❌ Configuration invalid: {e}");
            issues += 1;
            None
        }
    };

    if let Some(config) = &config {
        // Check database reachability
        match SqliteStore::new(
            &config.database.url,
            PoolOptions {
                max_connections: 1,
                min_connections: 1,
                max_lifetime: Duration::from_secs(60),
            },
        )
        .await
        {
            Ok(_) => println!("  ✅ Database reachable at {}", config.database.url),
            Err(e) => {
                println!("  ❌ Database unreachable: {e}");
                issues += 1;
            }
        }

        // Check secrets configuration
        if config.secrets.encryption_key.is_some() {
            println!("  ✅ Secret encryption key configured");
        } else {
            println!("  ⚠️  No encryption key — webhook secrets will be stored in plaintext");
            issues += 1;
        }

        // Check identity source
        if config.auth.static_principals.is_empty() {
            println!("  ⚠️  No principals configured — all requests will be rejected");
            issues += 1;
        } else {
            println!(
                "  ✅ {} principal(s) configured",
                config.auth.static_principals.len()
            );
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed.");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }
    Ok(())
}
