//! Hostlife daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use hostlife::{Config, DockerEngine, Hostlife, JsonFileStore, ServiceOptions, TimeoutEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting Hostlife daemon with config: {:?}", cfg);

    // Container engine (Docker), every call bounded by a timeout
    let docker = DockerEngine::connect(cfg.docker_socket.as_deref(), cfg.network.clone())?;
    let engine = Arc::new(TimeoutEngine::new(docker, cfg.engine_timeouts()));

    // Persisted intents
    let store = Arc::new(JsonFileStore::open(&cfg.state_file)?);

    let hostlife = Arc::new(Hostlife::new(engine, store, ServiceOptions::from(&cfg)));
    hostlife.engine_version().await;
    hostlife.hydrate()?;

    if cfg.sweep_orphans {
        match hostlife.sweep_orphans().await {
            Ok(n) => info!("Scheduled removal of {} orphaned containers", n),
            Err(e) => error!("Orphan sweep failed: {}", e),
        }
    }

    let prefetch_handle = cfg.prefetch_images.then(|| {
        let hostlife = Arc::clone(&hostlife);
        tokio::spawn(async move {
            let pulled = hostlife.prefetch_images().await;
            info!("Prefetched {} images", pulled);
        })
    });

    // Reconciler
    let Some(reconciler_handle) = hostlife.spawn() else {
        anyhow::bail!("reconciler already running");
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    reconciler_handle.abort();
    if let Some(handle) = prefetch_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
