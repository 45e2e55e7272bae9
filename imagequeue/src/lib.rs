//! A job queue turning uploaded images into web-ready assets in the background.
//!
//! Uploads are accepted through the [`submission::SubmissionService`], which enqueues a job on a
//! [`backend::Backend`] and returns immediately. Workers started by
//! [`ImageQueue::with_workers`] claim jobs, run an [`transform::ImageTransform`] on them and move
//! them through the job state machine, retrying failed attempts with backoff. Progress is read
//! through the [`status::StatusService`].
//!
//! # Example
//!
//! ```
//! # use imagequeue::prelude::*;
//! # use std::sync::Arc;
//! # struct Noop;
//! # #[async_trait::async_trait]
//! # impl ImageTransform for Noop {
//! #     async fn transform(&self, _input: TransformInput) -> Result<TransformOutput, TransformError> {
//! #         Err(TransformError::default())
//! #     }
//! # }
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use imagequeue::backend::memory::InMemoryBackend;
//!
//! let backend = InMemoryBackend::new();
//! let queue = ImageQueue::new(backend.clone()).with_workers(
//!     WorkerConfig::default().with_concurrency(2),
//!     Arc::new(Noop),
//!     Arc::new(LocalFileStorage::new("uploads")),
//! );
//!
//! queue.graceful_shutdown().await.unwrap();
//! # });
//! ```

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod backoff;
pub mod events;
pub mod job;
pub mod prelude;
pub mod pruner;
pub mod status;
pub mod storage;
pub mod submission;
pub mod transform;

use backend::Backend;
use events::{EventBus, JobEvent};
use job::runner::JobRunner;
use pruner::{runner::PrunerRunner, RetentionConfig};
use storage::FileStorage;
use transform::ImageTransform;

/// Settings for the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of workers, each processing one job at a time.
    pub concurrency: usize,
    /// Maximum duration of a single attempt.
    pub timeout: Option<Duration>,
    /// How often a worker extends the lease of the job it is processing.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: None,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            ..self
        }
    }
}

/// Owns the background tasks processing jobs on a backend.
///
/// Dropping the queue does not stop the tasks, call [`ImageQueue::graceful_shutdown`].
pub struct ImageQueue<B: Backend> {
    backend: B,
    events: EventBus,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<B> ImageQueue<B>
where
    B: Backend + Clone + 'static,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            events: Default::default(),
            cancellation_token: Default::default(),
            handles: Default::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Spawns `config.concurrency` workers.
    pub fn with_workers(
        mut self,
        config: WorkerConfig,
        transform: Arc<dyn ImageTransform>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        let runner = Arc::new(JobRunner::new(
            self.backend.clone(),
            transform,
            storage,
            self.events.clone(),
            &config,
        ));
        for worker in 0..config.concurrency {
            let handle = tokio::spawn({
                let backend = self.backend.clone();
                let runner = runner.clone();
                let cancellation_token = self.cancellation_token.clone();
                async move {
                    let mut stream = backend.subscribe_ready_jobs().await;
                    loop {
                        tokio::select! {
                            _ = cancellation_token.cancelled() => {
                                break;
                            },
                            message = stream.next() => {
                                match message {
                                    Some(Ok(job)) => runner.execute_job(job).await,
                                    Some(Err(error)) => {
                                        tracing::error!(?error, worker, "Failed to claim job: {error}");
                                        tokio::time::sleep(Duration::from_secs(1)).await;
                                    }
                                    None => {
                                        tracing::warn!(worker, "Job stream closed");
                                        break;
                                    }
                                }
                            },
                        }
                    }
                    tracing::debug!(worker, "Shutting down image queue worker");
                }
            });
            self.handles.push(handle);
        }
        self
    }

    /// Spawns the retention pruner.
    pub fn with_job_pruner(mut self, config: RetentionConfig) -> Self {
        let handle = PrunerRunner::new(self.backend.clone(), config)
            .spawn(self.cancellation_token.clone());
        self.handles.push(handle);
        self
    }

    /// Periodically returns jobs whose worker stopped heartbeating to the queue.
    pub fn with_lease_reaper(mut self, interval: Duration) -> Self {
        let handle = tokio::spawn({
            let backend = self.backend.clone();
            let cancellation_token = self.cancellation_token.clone();
            async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match backend.reclaim_expired_leases().await {
                                Ok(reclaimed) if reclaimed.is_empty() => {}
                                Ok(reclaimed) => tracing::warn!(
                                    ?reclaimed,
                                    "Reclaimed {} jobs with expired leases",
                                    reclaimed.len()
                                ),
                                Err(err) => tracing::error!(?err, "Failed to reclaim expired leases: {err}"),
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the lease reaper");
                            break;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
        self
    }

    /// A receiver of every [`JobEvent`] published from now on.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stops all background tasks. Jobs being processed finish their current attempt first.
    pub async fn graceful_shutdown(self) -> Result<(), ImageQueueError> {
        tracing::debug!("Shutting down image queue tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|res| res.map_err(|_| ImageQueueError::GracefulShutdownFailed))
    }
}

#[derive(Debug, Error)]
pub enum ImageQueueError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, testing::BackendTesting, EnqueuableJob},
        job::JobStatus,
        storage::MockFileStorage,
        transform::{
            ImageAssets, MockImageTransform, TransformError, TransformInput, TransformOutput,
        },
    };

    fn storage() -> Arc<MockFileStorage> {
        let mut storage = MockFileStorage::new();
        storage.expect_remove_upload().returning(|_| Ok(()));
        Arc::new(storage)
    }

    async fn wait_for(
        events: &mut tokio::sync::broadcast::Receiver<JobEvent>,
        matches: impl Fn(&JobEvent) -> bool,
    ) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn workers_complete_jobs() {
        let backend = InMemoryBackend::new();
        let mut transform = MockImageTransform::new();
        transform
            .expect_transform()
            .returning(|input| Ok(TransformOutput::new(ImageAssets::for_job(&input.id))));
        let queue = ImageQueue::new(backend.clone()).with_workers(
            WorkerConfig::default().with_concurrency(2),
            Arc::new(transform),
            storage(),
        );
        let mut events = queue.subscribe_events();

        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        wait_for(&mut events, |event| {
            matches!(event, JobEvent::Completed { .. }) && event.id() == &id
        })
        .await;

        assert_eq!(backend.job(&id).await.status, JobStatus::Completed);
        queue.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn workers_retry_until_attempts_are_exhausted() {
        let backend = InMemoryBackend::new();
        let mut transform = MockImageTransform::new();
        transform
            .expect_transform()
            .times(2)
            .returning(|_: TransformInput| Err(TransformError::new("unsupported format")));
        let queue = ImageQueue::new(backend.clone()).with_workers(
            WorkerConfig::default(),
            Arc::new(transform),
            storage(),
        );
        let mut events = queue.subscribe_events();

        let mut job = EnqueuableJob::mock_job().with_max_attempts(2);
        job.backoff = crate::backoff::BackoffStrategy::fixed(TimeDelta::milliseconds(10)).into();
        let id = backend.enqueue(job).await.unwrap();

        let event = wait_for(&mut events, |event| matches!(event, JobEvent::Failed { .. })).await;
        assert_eq!(
            event,
            JobEvent::Failed {
                id: id.clone(),
                attempt: 2,
                error: "Failed to process images".to_owned(),
            }
        );

        let job = backend.job(&id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.errors.len(), 2);
        queue.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn lease_reaper_requeues_abandoned_jobs() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(10));
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.claim(&id).await;
        let queue =
            ImageQueue::new(backend.clone()).with_lease_reaper(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.job(&id).await.status, JobStatus::Waiting);
        queue.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn graceful_shutdown_without_tasks() {
        let queue = ImageQueue::new(InMemoryBackend::new());

        assert!(queue.graceful_shutdown().await.is_ok());
    }
}
