//! whisper-queue - Transcription Job Queue Orchestrator
//!
//! Admits submitted transcription jobs into a durable queue, dispatches them
//! to an external GPU batch executor under a concurrency ceiling, reaps
//! stuck jobs, and reconciles terminal outcomes reported over pub/sub.

use std::sync::Arc;

use tracing::{error, info};
use whisper_queue::config::Settings;
use whisper_queue::database;
use whisper_queue::logging::init_logging;
use whisper_queue::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them
    dotenvy::dotenv().ok();

    init_logging().map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting whisper-queue v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;

    info!("Connecting to database: {}", settings.database_url);
    let pool = database::init_pool(&settings.database_url).await?;

    let container = Arc::new(ServiceContainer::new(pool, settings).await?);
    container.start().await?;

    info!("whisper-queue started successfully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down services...");
    if let Err(e) = container.shutdown().await {
        error!("Error during shutdown: {}", e);
    }

    info!("whisper-queue shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// Wait for SIGTERM signal (Windows - uses ctrl_c as fallback).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
