//! Process engine node binary.
//!
//! Deploys process definitions and runs the job scheduler against the
//! configured store until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use process_engine::{
    DatabaseConfig, EngineConfig, InMemoryStore, PgStore, ProcessEngine, StorageBackend,
};

#[derive(Debug, Parser)]
#[command(name = "engine-node", version, about = "Run a process engine node")]
struct Args {
    /// Directory of YAML process definitions (overrides ENGINE_DEFINITIONS_DIR)
    #[arg(short, long)]
    definitions: Option<PathBuf>,

    /// Use the in-memory store regardless of ENGINE_STORAGE
    #[arg(long)]
    memory: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,process_engine=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.json);

    tracing::info!("Starting process engine node");

    let mut config = EngineConfig::from_env().context("invalid ENGINE_* configuration")?;
    if let Some(dir) = args.definitions {
        config.definitions_dir = Some(dir);
    }
    if args.memory {
        config.storage = StorageBackend::Memory;
    }
    tracing::info!(
        node_id = %config.node_id,
        storage = ?config.storage,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Engine configuration loaded"
    );

    let mut builder = ProcessEngine::builder(config.clone());
    builder = match config.storage {
        StorageBackend::Memory => builder.store(Arc::new(InMemoryStore::new())),
        StorageBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().context("invalid POSTGRES_* configuration")?;
            let store = PgStore::connect(&db_config).await?;
            if !store.health_check().await {
                anyhow::bail!("database at {} is not reachable", db_config.display_url());
            }
            store.ensure_schema().await?;
            builder.store(Arc::new(store))
        }
    };
    let engine = builder.build()?;

    engine.job_scheduler().start();

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }

    engine.job_scheduler().shutdown().await?;
    tracing::info!("Engine node stopped");
    Ok(())
}
