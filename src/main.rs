//! Quillstore binary entry point
//!
//! Opens the store and runs the periodic jobs until interrupted. The web
//! layer links the library and shares the same `Store`.

use quillstore::{Store, config, scheduler};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Open the store (runs migrations)
/// 5. Start background jobs
/// 6. Wait for Ctrl-C, then close the pool
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("quillstore={},sqlx=warn", config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        database = %config.database.path.display(),
        "Starting Quillstore..."
    );

    // 3. Initialize metrics
    quillstore::metrics::init_metrics();

    // 4. Open the store
    let store = Arc::new(Store::open(config).await?);

    // 5. Start background jobs
    let sweep = scheduler::spawn_publish_sweep(store.clone());
    let maintenance = scheduler::spawn_maintenance(store.clone());

    // 6. Run until interrupted
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    sweep.abort();
    maintenance.abort();
    store.close().await;

    Ok(())
}
