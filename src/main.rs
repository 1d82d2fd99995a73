//! # Steward Main Entry Point
//!
//! Loads configuration, bootstraps the tenant registry from the store, then
//! runs the worker pool, the sync loop and the status API until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use steward::{
    collector::Collector,
    config::ConfigLoader,
    db,
    dispatcher::Dispatcher,
    registry::TenantRegistry,
    responses::BuiltinHandlerFactory,
    server::{AppState, run_server},
    store::DatabaseStore,
    sync_loop::SyncLoop,
    telemetry,
    worker::WorkProcessor,
};

#[derive(Debug, Parser)]
#[command(name = "steward", version, about = "Tenant work scheduler")]
struct Cli {
    /// Directory holding the layered `.env` files
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Do not apply pending database migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match cli.base_dir {
        Some(base_dir) => ConfigLoader::with_base_dir(base_dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;

    telemetry::init_tracing(&config).context("initializing telemetry")?;
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    if cli.skip_migrations {
        info!("Skipping database migrations");
    } else {
        Migrator::up(&db, None)
            .await
            .context("applying database migrations")?;
    }

    let registry = Arc::new(TenantRegistry::new());
    let processor = Arc::new(WorkProcessor::new(
        registry.clone(),
        Arc::new(BuiltinHandlerFactory),
    ));
    let (collector, inbound) = Collector::channel(config.scheduler.inbound_queue_depth);

    let mut sync_loop = SyncLoop::new(
        Arc::new(DatabaseStore::new(db.clone())),
        collector,
        processor.clone(),
        &config.scheduler,
    );
    sync_loop.bootstrap().await;

    let dispatcher = Dispatcher::start(config.scheduler.worker_pool_size, inbound, processor);
    let sync_handle = sync_loop.start();

    let server_shutdown = CancellationToken::new();
    let server = {
        let config = config.clone();
        let state = AppState {
            db: db.clone(),
            registry,
        };
        let shutdown = server_shutdown.clone();
        tokio::spawn(async move { run_server(&config, state, shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    if !sync_handle.stop().await {
        error!("Sync loop exited without acknowledging stop");
    }

    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = ?err, "Status server failed"),
        Err(err) => error!(error = ?err, "Status server task panicked"),
    }

    dispatcher.shutdown().await;
    info!("Steward stopped");
    Ok(())
}
