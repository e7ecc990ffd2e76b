// doclib - document library backend
// Entry point: logging, configuration and background jobs

use anyhow::Context;
use doclib::app::App;
use doclib::config::AppConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doclib=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting doclib");

    let config_path = std::env::var_os("DOCLIB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data/config.json"));

    let config = AppConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let app = App::build(config)
        .await
        .context("Failed to initialize application")?;

    app.start_background_jobs()
        .await
        .context("Failed to start background jobs")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested");
    app.shutdown().await?;
    Ok(())
}
