use anyhow::{Context, Result};
use facefind_core::{EventDirectory, MatchCache};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{MatcherService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facefindd starting");

    let config = Config::from_env();
    tracing::info!(
        events = %config.events_dir.display(),
        database = %config.database_dir.display(),
        cascade = %config.cascade_path.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("facefind-scan-{i}"));
    if let Some(workers) = config.workers {
        pool = pool.num_threads(workers);
    }
    pool.build_global().context("failed to build scan thread pool")?;

    let events = Arc::new(EventDirectory::new(&config.events_dir, &config.database_dir));
    let engine = engine::spawn_engine(&config.cascade_path, events.clone())
        .with_context(|| format!("failed to load cascade {}", config.cascade_path.display()))?;

    let cache = Arc::new(MatchCache::new());
    let service = MatcherService::new(engine, cache, events, config.cascade_path.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facefindd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facefindd shutting down");

    Ok(())
}
