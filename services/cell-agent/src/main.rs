//! loft Cell Agent
//!
//! Runs on each execution host and places desired workloads onto it. The
//! agent subscribes to the distributed store's desired-workload feed,
//! filters events by this cell's stack, and drives each matching workload
//! through reserve, claim, initialize, and run against the execution
//! backend, compensating backward when a step fails.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loft_cell_agent::config::Config;
use loft_cell_agent::executor::HttpExecutorClient;
use loft_cell_agent::scheduler::Scheduler;
use loft_cell_agent::store::HttpStoreGateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting loft cell agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        cell_id = %config.cell_id,
        stack = %config.stack,
        store_url = %config.store_url,
        executor_url = %config.executor_url,
        "Configuration loaded"
    );

    // Collaborator clients
    let store = Arc::new(HttpStoreGateway::new(&config));
    let executor = Arc::new(HttpExecutorClient::new(&config));

    // Subscribe and start dispatching placements
    let scheduler = Scheduler::new(&config, store, executor);
    scheduler.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Halt intake; in-flight placements finish on their own
    scheduler.stop()?;

    info!("Waiting for in-flight placements...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Cell agent shutdown complete");
    Ok(())
}
