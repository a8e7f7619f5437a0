//! Automation Lifecycle Server
//!
//! Loads persisted versions, backups and dependencies, runs the periodic
//! cleanup sweep and flushes state back to `.storage/` on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ha_config::LifecycleConfig;
use ha_core::NoopAuthoring;
use ha_lifecycle::AutomationLifecycle;
use ha_storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "HA_LIFECYCLE_CONFIG";

fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from))
}

fn load_config() -> Result<LifecycleConfig> {
    match config_path() {
        Some(path) => LifecycleConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => {
            info!("No configuration file given, using defaults");
            Ok(LifecycleConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting automation lifecycle service");

    let config = load_config()?;
    let storage = Storage::new(&config.storage.config_dir);
    let cleanup_interval = config.cleanup.interval();

    // Standalone mode: no runtime attached, pushes always succeed
    let lifecycle = Arc::new(AutomationLifecycle::new(config, Arc::new(NoopAuthoring)));
    lifecycle
        .load(&storage)
        .await
        .context("failed to load persisted lifecycle state")?;

    let health = lifecycle.health();
    info!(
        automations = health.automations,
        versions = health.versions,
        backups = health.backups,
        dependencies = health.dependencies,
        "Automation lifecycle service is running"
    );

    let sweeper = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                lifecycle.cleanup_expired();
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    sweeper.abort();

    if let Err(err) = lifecycle.save(&storage).await {
        warn!(error = %err, "Failed to save lifecycle state");
        return Err(err.into());
    }
    info!("Lifecycle state saved");

    Ok(())
}
