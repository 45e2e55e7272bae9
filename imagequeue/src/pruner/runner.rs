use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

use super::RetentionConfig;

pub(crate) struct PrunerRunner<B: Backend> {
    config: RetentionConfig,
    backend: B,
}

impl<B> PrunerRunner<B>
where
    B: Backend + 'static,
{
    pub fn new(backend: B, config: RetentionConfig) -> Self {
        Self { backend, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("No future scheduled time for the job pruner");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.prune().await;
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job pruner");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn prune(&self) {
        futures::stream::iter(&self.config.pruners)
            .for_each_concurrent(self.config.max_concurrency, |spec| async move {
                match self.backend.prune_jobs(spec).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(status = %spec.status, removed, "Pruned terminal jobs")
                    }
                    Err(err) => tracing::error!(?err, "Failed to clean up jobs with error {err}"),
                }
            })
            .await;
    }
}

#[cfg(test)]
mod test {
    use std::{
        pin::Pin,
        str::FromStr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;
    use chrono::DateTime;
    use futures::Stream;

    use crate::{
        backend::{
            memory::InMemoryBackend, testing::BackendTesting, Backend, BackendError,
            EnqueuableJob, ExecutionError, Job, JobId, Query,
        },
        job::JobStatus,
        pruner::PruneSpec,
        transform::TransformOutput,
    };

    use super::*;

    /// Records the most prune calls ever in flight at once.
    #[derive(Clone, Default)]
    struct ConcurrencyTracking {
        inner: InMemoryBackend,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for ConcurrencyTracking {
        async fn subscribe_ready_jobs(
            &self,
        ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
            self.inner.subscribe_ready_jobs().await
        }
        async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
            self.inner.enqueue(job).await
        }
        async fn fetch_next(&self) -> Result<Option<Job>, BackendError> {
            self.inner.fetch_next().await
        }
        async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
            self.inner.get_job(id).await
        }
        async fn mark_job_complete(
            &self,
            id: &JobId,
            attempt: u16,
            result: TransformOutput,
        ) -> Result<(), BackendError> {
            self.inner.mark_job_complete(id, attempt, result).await
        }
        async fn mark_job_retry(
            &self,
            id: &JobId,
            attempt: u16,
            next_scheduled_at: DateTime<Utc>,
            error: ExecutionError,
        ) -> Result<(), BackendError> {
            self.inner
                .mark_job_retry(id, attempt, next_scheduled_at, error)
                .await
        }
        async fn mark_job_failed(
            &self,
            id: &JobId,
            attempt: u16,
            error: ExecutionError,
        ) -> Result<(), BackendError> {
            self.inner.mark_job_failed(id, attempt, error).await
        }
        async fn heartbeat(&self, id: &JobId, attempt: u16) -> Result<(), BackendError> {
            self.inner.heartbeat(id, attempt).await
        }
        async fn reclaim_expired_leases(&self) -> Result<Vec<JobId>, BackendError> {
            self.inner.reclaim_expired_leases().await
        }
        async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<usize, BackendError> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(in_flight, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.prune_jobs(prune_spec).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
        async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
            self.inner.query(query).await
        }
    }

    fn three_pruners() -> RetentionConfig {
        RetentionConfig::new(cron::Schedule::from_str("0 * * * * *").unwrap()).with_pruners([
            PruneSpec::max_length(10, JobStatus::Completed),
            PruneSpec::max_length(10, JobStatus::Failed),
            PruneSpec::max_age(TimeDelta::hours(1), JobStatus::Failed),
        ])
    }

    #[tokio::test]
    async fn prune_respects_max_concurrency() {
        let backend = ConcurrencyTracking::default();
        let config = three_pruners().with_max_concurrency(Some(1));

        PrunerRunner::new(backend.clone(), config).prune().await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prune_runs_specs_concurrently_when_unbounded() {
        let backend = ConcurrencyTracking::default();
        let config = three_pruners().with_max_concurrency(None);

        PrunerRunner::new(backend.clone(), config).prune().await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn prune_applies_every_spec() {
        let backend = InMemoryBackend::new();
        for _ in 0..3 {
            let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
            backend.claim_and_complete(&id).await;
        }
        for _ in 0..2 {
            let id = backend
                .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
                .await
                .unwrap();
            backend.claim_and_fail(&id).await;
        }
        let config = RetentionConfig::new(cron::Schedule::from_str("0 * * * * *").unwrap())
            .with_pruners([
                PruneSpec::max_length(1, JobStatus::Completed),
                PruneSpec::max_age(TimeDelta::zero(), JobStatus::Failed),
            ]);

        PrunerRunner::new(backend.clone(), config).prune().await;

        let remaining = backend
            .query(Query::Not(Box::new(Query::StatusEqual(JobStatus::Waiting))))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn spawned_pruner_stops_on_cancellation() {
        let backend = InMemoryBackend::new();
        let config = RetentionConfig::new(cron::Schedule::from_str("0 0 0 1 1 * *").unwrap());
        let token = CancellationToken::new();

        let handle = PrunerRunner::new(backend, config).spawn(token.clone());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
