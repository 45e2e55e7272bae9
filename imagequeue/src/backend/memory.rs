//! Provides an in memory implementation of [`Backend`].
//!
//! Every mutation happens under a single write lock, so a change is visible to readers only once
//! it is complete and two concurrent claims can never hand out the same job.
//!
//! Jobs do not survive a restart of the process.
use std::{
    collections::HashSet,
    ops::Sub,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::{
    queryable::Queryable, Backend, BackendError, EnqueuableJob, ExecutionError, Job, Query,
};
use crate::{
    job::{ErrorType, JobError, JobId, JobStatus},
    pruner::{PruneBy, PruneSpec},
    transform::TransformOutput,
};

struct ReadyJobStream {
    backend: InMemoryBackend,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyJobStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    pub async fn next(&mut self) -> Result<Job, BackendError> {
        loop {
            if let Some(job) = self.backend.claim_next_job()? {
                return Ok(job);
            }
            let delay = match self.backend.next_wake_up_at()? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .clamp(Self::DELTA, Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(delay) => { },
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

#[derive(Default)]
struct Store {
    jobs: Vec<Job>,
    issued_ids: HashSet<JobId>,
}

impl Store {
    fn find_mut(&mut self, id: &JobId) -> Result<&mut Job, BackendError> {
        self.jobs
            .iter_mut()
            .find(|job| &job.id == id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))
    }

    fn promote_due_jobs(&mut self, now: DateTime<Utc>) {
        self.jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Delayed && job.scheduled_at <= now)
            .for_each(|job| job.status = JobStatus::Waiting);
    }

    fn reclaim_expired_leases(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .iter_mut()
            .filter(|job| {
                job.status == JobStatus::Active
                    && job.lease_expires_at.is_some_and(|expires_at| expires_at <= now)
            })
            .map(|job| {
                job.reclaim(now);
                job.id.clone()
            })
            .collect()
    }
}

/// An in memory implementation of [`Backend`].
///
/// Pruning removes job records, but the id of every job ever enqueued is kept so it can never be
/// issued again. That set grows by one id per job for the lifetime of the process.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<RwLock<Store>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    paused: Arc<AtomicBool>,
    lease: TimeDelta,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            store: Default::default(),
            subscribers: Default::default(),
            paused: Default::default(),
            lease: Self::DEFAULT_LEASE,
        }
    }
}

impl InMemoryBackend {
    /// How long a claimed job stays leased to its worker without a heartbeat.
    pub const DEFAULT_LEASE: TimeDelta = TimeDelta::seconds(30);

    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(self, lease: TimeDelta) -> Self {
        Self { lease, ..self }
    }

    /// Run the backend in paused mode where streams will not be woken up when jobs are inserted or
    /// updated.
    ///
    /// If you would like to then run jobs later in the test you can call
    /// [`InMemoryBackend::notify_all`].
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all the stream subscribers to continue execution.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        self.send_to_subscribers(Utc::now())
    }

    fn notify_subscribers(&self, scheduled_at: DateTime<Utc>) -> Result<(), BackendError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.send_to_subscribers(scheduled_at)
    }

    fn send_to_subscribers(&self, scheduled_at: DateTime<Utc>) -> Result<(), BackendError> {
        self.subscribers
            .write()
            .map_err(|_| BackendError::BadState)?
            .retain(|sender| sender.send(scheduled_at).is_ok());
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Store>, BackendError> {
        self.store.write().map_err(|_| BackendError::BadState)
    }

    fn claim_next_job(&self) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let lease_expires_at = now + self.lease;
        let mut store = self.write()?;
        if !store.reclaim_expired_leases(now).is_empty() {
            tracing::debug!("Reclaimed jobs with expired leases");
        }
        store.promote_due_jobs(now);
        Ok(store
            .jobs
            .iter_mut()
            .filter(|job| {
                job.status == JobStatus::Waiting
                    && job.scheduled_at - now < TimeDelta::milliseconds(100)
            })
            .min_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at))
            .map(|job| {
                job.mark_job_active(now, lease_expires_at);
                job.clone()
            }))
    }

    /// The earliest moment something could become claimable.
    fn next_wake_up_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(self
            .store
            .read()
            .map_err(|_| BackendError::BadState)?
            .jobs
            .iter()
            .filter_map(|job| match job.status {
                JobStatus::Waiting | JobStatus::Delayed => Some(job.scheduled_at),
                JobStatus::Active => job.lease_expires_at,
                JobStatus::Completed | JobStatus::Failed => None,
            })
            .min())
    }

    fn transition(
        &self,
        id: &JobId,
        apply: impl FnOnce(&mut Job, DateTime<Utc>) -> Result<(), BackendError>,
    ) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut store = self.write()?;
        store.promote_due_jobs(now);
        apply(store.find_mut(id)?, now)
    }
}

impl EnqueuableJob {
    pub(super) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            status: JobStatus::Waiting,
            payload: self.payload,
            attempt: 0,
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff,
            result: None,
            failure_reason: None,
            errors: vec![],
            inserted_at: now,
            scheduled_at: self.scheduled_at,
            attempted_at: None,
            completed_at: None,
            failed_at: None,
            lease_expires_at: None,
        }
    }
}

impl ExecutionError {
    fn into_job_error(self, attempt: u16, recorded_at: DateTime<Utc>) -> JobError {
        JobError {
            attempt,
            error_type: self.error_type,
            details: self.message,
            recorded_at,
        }
    }
}

impl Job {
    /// Only the holder of the current claim may move an active job.
    fn ensure_claimed(&self, attempt: u16, to: JobStatus) -> Result<(), BackendError> {
        match self.status {
            JobStatus::Active if self.attempt == attempt => Ok(()),
            from => Err(BackendError::InvalidTransition {
                id: self.id.clone(),
                from,
                to,
            }),
        }
    }

    fn mark_job_active(&mut self, now: DateTime<Utc>, lease_expires_at: DateTime<Utc>) {
        self.attempted_at = Some(now);
        self.attempt += 1;
        self.lease_expires_at = Some(lease_expires_at);
        self.status = JobStatus::Active;
    }

    fn mark_job_complete(&mut self, now: DateTime<Utc>, result: TransformOutput) {
        self.result = Some(result);
        self.failure_reason = None;
        self.completed_at = Some(now);
        self.lease_expires_at = None;
        self.status = JobStatus::Completed;
    }

    fn mark_job_delayed(
        &mut self,
        now: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) {
        self.errors.push(error.into_job_error(self.attempt, now));
        self.scheduled_at = scheduled_at;
        self.lease_expires_at = None;
        self.status = JobStatus::Delayed;
    }

    fn mark_job_failed(&mut self, now: DateTime<Utc>, error: ExecutionError) {
        self.failure_reason = Some(error.message.clone());
        self.errors.push(error.into_job_error(self.attempt, now));
        self.result = None;
        self.failed_at = Some(now);
        self.lease_expires_at = None;
        self.status = JobStatus::Failed;
    }

    fn reclaim(&mut self, now: DateTime<Utc>) {
        if self.is_final_attempt() {
            self.mark_job_failed(
                now,
                ExecutionError {
                    error_type: ErrorType::LeaseExpired,
                    message: "Worker lease expired".to_owned(),
                },
            );
        } else {
            self.lease_expires_at = None;
            self.scheduled_at = now;
            self.status = JobStatus::Waiting;
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe_ready_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(sender),
            Err(_) => tracing::error!("Failed to register subscriber, falling back to polling"),
        }

        let mut stream = ReadyJobStream {
            receiver,
            backend: self.clone(),
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = job.id.clone();
        let scheduled_at = job.scheduled_at;
        {
            let mut store = self.write()?;
            if !store.issued_ids.insert(id.clone()) {
                return Err(BackendError::DuplicateJob(id));
            }
            store.jobs.push(job.into_job(Utc::now()));
        }
        self.notify_subscribers(scheduled_at)?;
        Ok(id)
    }

    async fn fetch_next(&self) -> Result<Option<Job>, BackendError> {
        self.claim_next_job()
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        let mut store = self.write()?;
        store.promote_due_jobs(Utc::now());
        Ok(store.jobs.iter().find(|job| &job.id == id).cloned())
    }

    async fn mark_job_complete(
        &self,
        id: &JobId,
        attempt: u16,
        result: TransformOutput,
    ) -> Result<(), BackendError> {
        self.transition(id, |job, now| {
            job.ensure_claimed(attempt, JobStatus::Completed)?;
            job.mark_job_complete(now, result);
            Ok(())
        })
    }

    async fn mark_job_retry(
        &self,
        id: &JobId,
        attempt: u16,
        next_scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.transition(id, |job, now| {
            job.ensure_claimed(attempt, JobStatus::Delayed)?;
            if job.is_final_attempt() {
                return Err(BackendError::InvalidTransition {
                    id: job.id.clone(),
                    from: job.status,
                    to: JobStatus::Delayed,
                });
            }
            job.mark_job_delayed(now, next_scheduled_at, error);
            Ok(())
        })?;
        self.notify_subscribers(next_scheduled_at)
    }

    async fn mark_job_failed(
        &self,
        id: &JobId,
        attempt: u16,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.transition(id, |job, now| {
            job.ensure_claimed(attempt, JobStatus::Failed)?;
            job.mark_job_failed(now, error);
            Ok(())
        })
    }

    async fn heartbeat(&self, id: &JobId, attempt: u16) -> Result<(), BackendError> {
        let lease = self.lease;
        self.transition(id, |job, now| {
            job.ensure_claimed(attempt, JobStatus::Active)?;
            job.lease_expires_at = Some(now + lease);
            Ok(())
        })
    }

    async fn reclaim_expired_leases(&self) -> Result<Vec<JobId>, BackendError> {
        let now = Utc::now();
        let reclaimed = self.write()?.reclaim_expired_leases(now);
        if !reclaimed.is_empty() {
            self.notify_subscribers(now)?;
        }
        Ok(reclaimed)
    }

    async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<usize, BackendError> {
        let now = Utc::now();
        let mut store = self.write()?;
        let before = store.jobs.len();
        match prune_spec.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = now - age;
                store.jobs.retain(|job| {
                    !prune_spec.matches(job)
                        || job.finished_at().is_some_and(|finished_at| finished_at >= cutoff)
                });
            }
            PruneBy::MaxLength(length) => {
                let mut finished: Vec<_> = store
                    .jobs
                    .iter()
                    .filter(|job| prune_spec.matches(job))
                    .map(|job| (job.finished_at(), job.id.clone()))
                    .collect();
                finished.sort_by(|a, b| b.0.cmp(&a.0));
                let evicted: HashSet<JobId> = finished
                    .into_iter()
                    .skip(length as usize)
                    .map(|(_, id)| id)
                    .collect();
                store.jobs.retain(|job| !evicted.contains(&job.id));
            }
        };
        Ok(before - store.jobs.len())
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        let mut store = self.write()?;
        store.promote_due_jobs(Utc::now());
        Ok(store
            .jobs
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use std::{ops::Add, time::Duration};

    use assert_matches::assert_matches;
    use futures::StreamExt;

    use super::*;
    use crate::{
        backend::testing::{mock_output, BackendTesting},
        test_suite,
    };

    test_suite!(for: InMemoryBackend::new());

    fn error() -> ExecutionError {
        ExecutionError {
            error_type: ErrorType::Transform,
            message: "Failed to process images".to_owned(),
        }
    }

    #[tokio::test]
    async fn subscribe_ready_jobs_enqueuing_does_not_wake_subscriber_when_paused() {
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs().await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(_job))) => panic!("Should not get woken up"),
                Err(_) => {}
                _ => panic!("Bad things happened"),
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn calling_notify_all_continues_execution() {
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs().await;
        let job = EnqueuableJob::mock_job();
        let expected = job.id.clone();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(job))) => assert_eq!(job.id, expected),
                Err(_) => panic!("Didn't get woken by notify_all"),
                _ => panic!("Bad things happened"),
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.enqueue(job).await.unwrap();
        backend.notify_all().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_returns_job_to_waiting() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(10));
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.fetch_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reclaimed = backend.reclaim_expired_leases().await.unwrap();

        assert_eq!(reclaimed, vec![id.clone()]);
        let job = backend.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt, 1);
        assert!(job.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn expired_lease_on_final_attempt_fails_job() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(10));
        let id = backend
            .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
            .await
            .unwrap();
        backend.fetch_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.reclaim_expired_leases().await.unwrap();

        let job = backend.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].error_type, ErrorType::LeaseExpired);
        assert!(job.failure_reason.is_some());
        assert!(job.failed_at.is_some());
    }

    #[tokio::test]
    async fn claim_reclaims_expired_leases() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(10));
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.fetch_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job = backend.fetch_next().await.unwrap().unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn expired_claim_cannot_change_reclaimed_job() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(50));
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let first = backend.fetch_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = backend.fetch_next().await.unwrap().unwrap();
        assert_eq!((first.attempt, second.attempt), (1, 2));

        assert_matches!(
            backend
                .mark_job_retry(&id, first.attempt, Utc::now(), error())
                .await,
            Err(BackendError::InvalidTransition { .. })
        );
        assert_matches!(
            backend.heartbeat(&id, first.attempt).await,
            Err(BackendError::InvalidTransition { .. })
        );
        assert!(backend.fetch_next().await.unwrap().is_none());

        backend
            .mark_job_complete(&id, second.attempt, mock_output(&id))
            .await
            .unwrap();
        let job = backend.job(&id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 2);
        assert!(job.errors.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_alive() {
        let backend = InMemoryBackend::new().with_lease(TimeDelta::milliseconds(200));
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.fetch_next().await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            backend.heartbeat(&id, 1).await.unwrap();
        }

        assert!(backend.reclaim_expired_leases().await.unwrap().is_empty());
        assert_eq!(
            backend.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Active
        );
    }

    #[tokio::test]
    async fn retried_job_is_claimable_once_due() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.fetch_next().await.unwrap().unwrap();
        backend
            .mark_job_retry(&id, 1, Utc::now().add(TimeDelta::milliseconds(300)), error())
            .await
            .unwrap();

        assert!(backend.fetch_next().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let job = backend.fetch_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.store.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.fetch_next().await, Err(BackendError::BadState));
        assert_matches!(backend.get_job(&id).await, Err(BackendError::BadState));
        assert_matches!(
            backend.mark_job_failed(&id, 1, error()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.heartbeat(&id, 1).await, Err(BackendError::BadState));
        assert_matches!(
            backend
                .prune_jobs(&PruneSpec::max_length(5, JobStatus::Completed))
                .await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.query(Query::IdEquals(id)).await,
            Err(BackendError::BadState)
        );
    }

    #[tokio::test]
    async fn badstate_errors_subscribers() {
        let backend = InMemoryBackend::new();
        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.subscribers.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
    }

    #[tokio::test]
    async fn completed_job_cannot_be_claimed_again() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.claim_and_complete(&id).await;

        assert!(backend.fetch_next().await.unwrap().is_none());
        assert!(backend.reclaim_expired_leases().await.unwrap().is_empty());
    }
}
