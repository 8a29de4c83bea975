//! Agent Memory maintenance daemon
//!
//! Periodically prunes old summaries, sweeps expired short-term entries and
//! purges resolved idempotency records.

use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_memory::{Config, MemorySystem};

fn load_config() -> anyhow::Result<Config> {
    match std::env::var_os("AGENT_MEMORY_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!("Loading configuration from {:?}", path);
            Ok(Config::load(&path)?)
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    tracing::info!("Data directory: {:?}", config.data_dir);
    tracing::info!(
        "Running maintenance every {}s",
        config.maintenance_interval_secs
    );

    let interval = config.maintenance_interval();
    let system = MemorySystem::open(config)?;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = system.run_maintenance(chrono::Utc::now()).await {
                    tracing::error!(error = %e, "maintenance pass failed");
                    if !e.is_storage_unavailable() {
                        return Err(e.into());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
