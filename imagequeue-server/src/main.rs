use std::sync::Arc;

use anyhow::Context;
use imagequeue::{backend::memory::InMemoryBackend, prelude::*};
use imagequeue_server::{
    api::{self, AppState},
    config::Config,
    processor::ImageProcessor,
    telemetry,
};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = Config::load()?;
    let addr = config.addr()?;

    let backend = InMemoryBackend::new().with_lease(config.lease());
    let storage: Arc<dyn FileStorage> =
        Arc::new(LocalFileStorage::new(&config.storage.upload_dir));

    let queue = ImageQueue::new(backend.clone())
        .with_workers(
            config.worker_config(),
            Arc::new(ImageProcessor::new(&config.storage.output_dir)),
            storage.clone(),
        )
        .with_job_pruner(config.retention_config()?)
        .with_lease_reaper(config.reaper_interval());
    tokio::spawn(log_events(queue.subscribe_events()));

    let state = AppState::new(backend, storage).with_job_options(config.job_options());
    let app = api::router(state, config.server.max_upload_bytes);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, workers = config.queue.workers, "Server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Waiting for workers to finish");
    queue.graceful_shutdown().await?;
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(JobEvent::Failed { id, attempt, error }) => {
                tracing::error!(job_id = %id, attempt, "Job {id} has failed with {error}")
            }
            Ok(event) => tracing::debug!(job_id = %event.id(), ?event, "Job event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event listener fell behind")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
