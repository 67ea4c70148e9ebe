mod answer;
mod config;
mod dedup;
mod error;
mod feishu;
mod server;
#[cfg(test)]
mod testutil;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,larkrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  App: {}", config.feishu.app_id);
    info!("  Platform: {}", config.feishu.base_url);
    info!("  Answer provider: {}", config.answer.provider);
    info!(
        "  Dedup: ttl={}s, sweep every {}s",
        config.dedup.ttl_secs, config.dedup.sweep_interval_secs
    );

    let state = Arc::new(AppState::from_config(&config).await);

    info!("Relay is starting...");
    server::run(state, &config.server.bind, config.dedup.sweep_interval()).await?;

    Ok(())
}
