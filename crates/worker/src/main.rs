use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinicflow_engine::prelude::*;

mod definitions;
mod executors;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    // - RUST_LOG: Log filter (default: "clinicflow_worker=info,clinicflow_engine=info")
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinicflow_worker=info,clinicflow_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("clinicflow-worker starting...");

    let store: Arc<dyn InstanceStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let store = PostgresInstanceStore::connect(&database_url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, instances are kept in memory");
            Arc::new(InMemoryInstanceStore::new())
        }
    };

    let config = EngineConfig::from_env().with_dispatch(DispatchMode::Queued);
    let engine = WorkflowEngine::new(store, executors::builtin(), config);

    if let Ok(dir) = std::env::var("CLINICFLOW_DEFINITIONS_DIR") {
        let dir = PathBuf::from(dir);
        let published = definitions::publish_dir(&engine, &dir)
            .with_context(|| format!("Failed to load definitions from {}", dir.display()))?;
        tracing::info!(count = published, dir = %dir.display(), "definitions loaded");
    }

    let pool_config = WorkerPoolConfig::from_env();
    tracing::info!(
        worker_id = %pool_config.worker_id,
        workers = pool_config.worker_count,
        "Starting worker pool"
    );

    let pool = WorkerPool::new(engine.scheduler().clone(), pool_config);
    pool.start().context("Failed to start worker pool")?;

    // Recover anything left due by a previous process
    match engine.process_due().await {
        Ok(enqueued) if enqueued > 0 => tracing::info!(enqueued, "recovered due instances"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "initial due scan failed"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    pool.shutdown().await.context("Worker pool did not drain")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
