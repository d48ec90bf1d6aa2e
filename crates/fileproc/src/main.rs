use std::sync::Arc;

use tracing::{error, info};

use fileproc::config::{load_settings_from_env, StorageBackend};
use fileproc::error::ConfigError;
use fileproc::logging::init_tracing;
use fileproc::store::{default_database_path, MemoryStore, SqliteStore, Store};
use fileproc::{BatchProcessor, HttpCallbackDispatcher, JobManager};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("fileproc: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> fileproc::Result<()> {
    let settings = load_settings_from_env()?;
    init_tracing(&settings.logging);
    info!("Starting fileproc v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn Store> = match settings.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let path = settings
                .storage
                .path
                .clone()
                .or_else(default_database_path)
                .ok_or_else(|| ConfigError::Validation {
                    message: "No storage.path configured and no home directory found".to_string(),
                })?;
            info!(path = %path.display(), "Opening job store");
            Arc::new(SqliteStore::open(&path)?)
        }
    };

    let callbacks = Arc::new(HttpCallbackDispatcher::new(&settings.callbacks)?);
    let manager = JobManager::builder(settings, store)
        .with_callbacks(callbacks)
        .build();
    manager.start().await?;

    let batches = BatchProcessor::new(manager.clone());
    let cleanup_every = fileproc::time::hours(manager.settings().batch.cleanup_after_hours.max(1));
    let shutdown = manager.shutdown_token().clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(cleanup_every) => {
                    if let Err(e) = batches.cleanup_expired_batches().await {
                        error!(error = %e, "Batch cleanup failed");
                    }
                }
            }
        }
    });

    info!("Ready. Press Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    manager.shutdown().await;
    Ok(())
}
