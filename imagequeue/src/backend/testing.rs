//! Test suite for ensuring a correct implementation of a backend.
use std::{collections::HashSet, ops::Add, path::PathBuf, time::Duration};

use chrono::TimeDelta;
use futures::StreamExt;

use super::*;
use crate::{
    pruner::PruneBy,
    transform::{ImageAssets, TransformOutput},
};

const DELTA: TimeDelta = TimeDelta::milliseconds(1);

impl EnqueuableJob {
    pub(crate) fn mock_job() -> Self {
        Self {
            id: JobId::generate(),
            payload: ImagePayload {
                path: PathBuf::from("uploads/original"),
                original_name: "original.png".to_owned(),
                mime_type: "image/png".to_owned(),
            },
            max_attempts: 3,
            backoff: BackoffPolicy::DEFAULT,
            scheduled_at: Utc::now(),
        }
    }

    pub(crate) fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }
}

#[cfg(test)]
impl Job {
    pub(crate) fn raw_job() -> Self {
        EnqueuableJob::mock_job().into_job(Utc::now())
    }

    pub(crate) fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }
}

pub(crate) fn mock_output(id: &JobId) -> TransformOutput {
    TransformOutput::new(ImageAssets {
        webp: PathBuf::from(format!("output/{id}.webp")),
        mobile: PathBuf::from(format!("output/{id}-mobile.jpg")),
        placeholder: "data:image/png;base64,iVBORw0KGgo=".to_owned(),
    })
}

pub(crate) fn mock_error() -> ExecutionError {
    ExecutionError {
        error_type: ErrorType::Transform,
        message: "Failed to process images".to_owned(),
    }
}

/// Create test suite for an imagequeue backend.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// # use imagequeue::prelude::*;
/// use imagequeue::test_suite;
/// use imagequeue::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead:
///
/// ```ignore
/// use imagequeue::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        test_suite!(attr: tokio::test(flavor = "multi_thread"), args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn subscribe_ready_jobs $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_enqueuing_wakes_subscriber $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_enqueuing_wakes_subscriber(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_streams_jobs_in_schedule_order $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_streams_jobs_in_schedule_order(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_only_one_stream_receives_job $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_only_one_stream_receives_job(backend).await;
        }
        #[$attr]
        async fn fetch_next_claims_each_job_once $args {
          let backend = $backend;
          $crate::backend::testing::fetch_next_claims_each_job_once(backend).await;
        }
        #[$attr]
        async fn fetch_next_empty $args {
          let backend = $backend;
          $crate::backend::testing::fetch_next_empty(backend).await;
        }
        #[$attr]
        async fn fetch_next_skips_future_jobs $args {
          let backend = $backend;
          $crate::backend::testing::fetch_next_skips_future_jobs(backend).await;
        }
        #[$attr]
        async fn enqueue $args {
          let backend = $backend;
          $crate::backend::testing::enqueue(backend).await;
        }
        #[$attr]
        async fn enqueue_duplicate_id $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_duplicate_id(backend).await;
        }
        #[$attr]
        async fn enqueue_pruned_id_is_not_reused $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_pruned_id_is_not_reused(backend).await;
        }
        #[$attr]
        async fn mark_job_complete $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_complete(backend).await;
        }
        #[$attr]
        async fn mark_job_complete_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_complete_not_found(backend).await;
        }
        #[$attr]
        async fn mark_job_complete_requires_active $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_complete_requires_active(backend).await;
        }
        #[$attr]
        async fn terminal_jobs_reject_transitions $args {
          let backend = $backend;
          $crate::backend::testing::terminal_jobs_reject_transitions(backend).await;
        }
        #[$attr]
        async fn mark_job_retry $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_retry(backend).await;
        }
        #[$attr]
        async fn mark_job_retry_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_retry_not_found(backend).await;
        }
        #[$attr]
        async fn mark_job_retry_on_final_attempt_is_rejected $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_retry_on_final_attempt_is_rejected(backend).await;
        }
        #[$attr]
        async fn delayed_job_reported_as_waiting_once_due $args {
          let backend = $backend;
          $crate::backend::testing::delayed_job_reported_as_waiting_once_due(backend).await;
        }
        #[$attr]
        async fn mark_job_failed $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_failed(backend).await;
        }
        #[$attr]
        async fn mark_job_failed_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_failed_not_found(backend).await;
        }
        #[$attr]
        async fn stale_attempt_is_rejected $args {
          let backend = $backend;
          $crate::backend::testing::stale_attempt_is_rejected(backend).await;
        }
        #[$attr]
        async fn heartbeat_requires_active $args {
          let backend = $backend;
          $crate::backend::testing::heartbeat_requires_active(backend).await;
        }
        #[$attr]
        async fn query $args {
          let backend = $backend;
          $crate::backend::testing::query(backend).await;
        }
        #[$attr]
        async fn prune_jobs_max_length $args {
          let backend = $backend;
          $crate::backend::testing::prune_jobs_max_length(backend).await;
        }
        #[$attr]
        async fn prune_jobs_max_age $args {
          let backend = $backend;
          $crate::backend::testing::prune_jobs_max_age(backend).await;
        }
    };
}

#[doc(hidden)]
#[async_trait]
pub trait BackendTesting: Backend {
    /// Claims the next ready job, which must be `id`.
    async fn claim(&self, id: &JobId) -> Job {
        let job = self
            .fetch_next()
            .await
            .unwrap()
            .expect("There should be a ready job");
        assert_eq!(&job.id, id);
        job
    }

    async fn claim_and_complete(&self, id: &JobId) {
        let job = self.claim(id).await;
        self.mark_job_complete(id, job.attempt, mock_output(id))
            .await
            .unwrap();
    }

    async fn claim_and_fail(&self, id: &JobId) {
        let job = self.claim(id).await;
        self.mark_job_failed(id, job.attempt, mock_error())
            .await
            .unwrap();
    }

    async fn job(&self, id: &JobId) -> Job {
        self.get_job(id)
            .await
            .unwrap()
            .expect("Job should be enqueued")
    }
}

impl<T: Backend> BackendTesting for T {}

#[doc(hidden)]
pub async fn subscribe_ready_jobs(backend: impl BackendTesting) {
    let mut stream = backend.subscribe_ready_jobs().await;
    let job_id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = stream.next().await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.attempt, 1);
    assert!(job.attempted_at.is_some());
    assert!(job.lease_expires_at.is_some());
    assert_eq!(backend.job(&job_id).await.status, JobStatus::Active);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_enqueuing_wakes_subscriber(backend: impl BackendTesting) {
    let mut stream = backend.subscribe_ready_jobs().await;
    let job = EnqueuableJob::mock_job();
    let expected = job.id.clone();
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(job))) => assert_eq!(job.id, expected),
            Err(_) => panic!("Didn't get woken by enqueue of new job"),
            _ => panic!("Bad things happened"),
        }
    });
    tokio::task::yield_now().await;
    backend.enqueue(job).await.unwrap();
    handle.await.unwrap();
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_streams_jobs_in_schedule_order(backend: impl BackendTesting) {
    let scheduled_at1 = Utc::now();
    let scheduled_at2 = Utc::now() + TimeDelta::milliseconds(500);
    let mut stream = backend.subscribe_ready_jobs().await;
    let job_id1 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at2))
        .await
        .unwrap();
    let job_id2 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at1))
        .await
        .unwrap();
    let job_id3 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at1))
        .await
        .unwrap();

    let job_ids: [JobId; 3] = [
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
    ];
    assert_eq!(job_ids, [job_id2, job_id3, job_id1]);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_only_one_stream_receives_job(backend: impl BackendTesting) {
    let mut stream1 = backend.subscribe_ready_jobs().await;
    let mut stream2 = backend.subscribe_ready_jobs().await;
    let job_id1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job_id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job_ids: HashSet<_> = futures::future::join_all([stream1.next(), stream2.next()])
        .await
        .into_iter()
        .map(|res| res.unwrap().unwrap().id)
        .collect();
    let expected = [job_id1, job_id2].into_iter().collect();
    assert_eq!(job_ids, expected);
}

#[doc(hidden)]
pub async fn fetch_next_claims_each_job_once(backend: impl BackendTesting + Clone + 'static) {
    let mut expected = HashSet::new();
    for _ in 0..50 {
        expected.insert(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
    }

    let handles = (0..8).map(|_| {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut claimed = vec![];
            while let Some(job) = backend.fetch_next().await.unwrap() {
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        })
    });
    let claimed: Vec<JobId> = futures::future::join_all(handles)
        .await
        .into_iter()
        .flat_map(|res| res.unwrap())
        .collect();

    assert_eq!(claimed.len(), expected.len());
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), expected);
}

#[doc(hidden)]
pub async fn fetch_next_empty(backend: impl BackendTesting) {
    assert!(backend.fetch_next().await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn fetch_next_skips_future_jobs(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now().add(TimeDelta::hours(1))))
        .await
        .unwrap();

    assert!(backend.fetch_next().await.unwrap().is_none());
    assert_eq!(backend.job(&id).await.status, JobStatus::Waiting);
}

#[doc(hidden)]
pub async fn enqueue(backend: impl BackendTesting) {
    let job = EnqueuableJob::mock_job();
    let payload = job.payload.clone();
    let id1 = backend.enqueue(job).await.unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);
    let job = backend.job(&id1).await;
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.payload, payload);
    assert!(job.result.is_none());
    assert!(job.failure_reason.is_none());
    assert!(backend.get_job(&id2).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn enqueue_duplicate_id(backend: impl BackendTesting) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_id("duplicate"))
        .await
        .unwrap();

    assert!(matches!(
        backend
            .enqueue(EnqueuableJob::mock_job().with_id("duplicate"))
            .await,
        Err(BackendError::DuplicateJob(id)) if id.as_str() == "duplicate"
    ));
    assert_eq!(
        backend
            .query(Query::IdEquals("duplicate".into()))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[doc(hidden)]
pub async fn enqueue_pruned_id_is_not_reused(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_id("pruned"))
        .await
        .unwrap();
    backend.claim_and_complete(&id).await;
    backend
        .prune_jobs(&PruneSpec::max_length(0, JobStatus::Completed))
        .await
        .unwrap();
    assert!(backend.get_job(&id).await.unwrap().is_none());

    assert!(matches!(
        backend
            .enqueue(EnqueuableJob::mock_job().with_id("pruned"))
            .await,
        Err(BackendError::DuplicateJob(_))
    ));
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let claimed = backend.claim(&id).await;

    assert!(backend
        .mark_job_complete(&id, claimed.attempt, mock_output(&id))
        .await
        .is_ok());

    let job = backend.job(&id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(mock_output(&id)));
    assert!(job.failure_reason.is_none());
    assert!(job.completed_at.is_some());
    assert!(job.lease_expires_at.is_none());
    assert_eq!(job.attempt, 1);
}

#[doc(hidden)]
pub async fn mark_job_complete_not_found(backend: impl BackendTesting) {
    let id = JobId::from("missing");
    assert!(matches!(
        backend.mark_job_complete(&id, 1, mock_output(&id)).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_job_complete_requires_active(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(matches!(
        backend.mark_job_complete(&id, 0, mock_output(&id)).await,
        Err(BackendError::InvalidTransition {
            from: JobStatus::Waiting,
            to: JobStatus::Completed,
            ..
        })
    ));
    assert_eq!(backend.job(&id).await.status, JobStatus::Waiting);
}

#[doc(hidden)]
pub async fn terminal_jobs_reject_transitions(backend: impl BackendTesting) {
    let completed = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_and_complete(&completed).await;
    let failed = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_and_fail(&failed).await;

    for id in [&completed, &failed] {
        let before = backend.job(id).await;
        let attempt = before.attempt;

        assert!(matches!(
            backend.mark_job_complete(id, attempt, mock_output(id)).await,
            Err(BackendError::InvalidTransition { .. })
        ));
        assert!(matches!(
            backend.mark_job_failed(id, attempt, mock_error()).await,
            Err(BackendError::InvalidTransition { .. })
        ));
        assert!(matches!(
            backend.mark_job_retry(id, attempt, Utc::now(), mock_error()).await,
            Err(BackendError::InvalidTransition { .. })
        ));
        assert!(matches!(
            backend.heartbeat(id, attempt).await,
            Err(BackendError::InvalidTransition { .. })
        ));

        assert_eq!(backend.job(id).await, before);
    }
}

#[doc(hidden)]
pub async fn mark_job_retry(backend: impl BackendTesting) {
    let scheduled_at = Utc::now().add(TimeDelta::days(1));
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let claimed = backend.claim(&id).await;
    let error = mock_error();

    assert!(backend
        .mark_job_retry(&id, claimed.attempt, scheduled_at, error.clone())
        .await
        .is_ok());

    let job = backend.job(&id).await;
    assert_eq!(job.status, JobStatus::Delayed);
    assert!((job.scheduled_at - scheduled_at).abs() < DELTA);
    assert!(job.lease_expires_at.is_none());
    assert_eq!(job.errors.len(), 1);

    let job_error = job.errors.first().unwrap();
    assert_eq!(job_error.attempt, job.attempt);
    assert_eq!(job_error.error_type, error.error_type);
    assert_eq!(job_error.details, error.message);
}

#[doc(hidden)]
pub async fn mark_job_retry_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .mark_job_retry(&"missing".into(), 1, Utc::now(), mock_error())
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_job_retry_on_final_attempt_is_rejected(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    let claimed = backend.claim(&id).await;

    assert!(matches!(
        backend
            .mark_job_retry(&id, claimed.attempt, Utc::now(), mock_error())
            .await,
        Err(BackendError::InvalidTransition {
            from: JobStatus::Active,
            to: JobStatus::Delayed,
            ..
        })
    ));

    let job = backend.job(&id).await;
    assert_eq!(job.status, JobStatus::Active);
    assert!(job.errors.is_empty());
}

#[doc(hidden)]
pub async fn delayed_job_reported_as_waiting_once_due(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let claimed = backend.claim(&id).await;
    backend
        .mark_job_retry(
            &id,
            claimed.attempt,
            Utc::now() - TimeDelta::milliseconds(1),
            mock_error(),
        )
        .await
        .unwrap();

    assert_eq!(backend.job(&id).await.status, JobStatus::Waiting);

    let job = backend.claim(&id).await;
    assert_eq!(job.attempt, 2);
}

#[doc(hidden)]
pub async fn stale_attempt_is_rejected(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let first = backend.claim(&id).await;
    backend
        .mark_job_retry(&id, first.attempt, Utc::now() - DELTA, mock_error())
        .await
        .unwrap();
    let second = backend.claim(&id).await;
    assert_eq!(second.attempt, first.attempt + 1);
    let before = backend.job(&id).await;

    assert!(matches!(
        backend
            .mark_job_complete(&id, first.attempt, mock_output(&id))
            .await,
        Err(BackendError::InvalidTransition {
            from: JobStatus::Active,
            to: JobStatus::Completed,
            ..
        })
    ));
    assert!(matches!(
        backend
            .mark_job_retry(&id, first.attempt, Utc::now(), mock_error())
            .await,
        Err(BackendError::InvalidTransition { .. })
    ));
    assert!(matches!(
        backend
            .mark_job_failed(&id, first.attempt, mock_error())
            .await,
        Err(BackendError::InvalidTransition { .. })
    ));
    assert!(matches!(
        backend.heartbeat(&id, first.attempt).await,
        Err(BackendError::InvalidTransition { .. })
    ));
    assert_eq!(backend.job(&id).await, before);

    backend
        .mark_job_complete(&id, second.attempt, mock_output(&id))
        .await
        .unwrap();
    let job = backend.job(&id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.errors.len(), 1);
}

#[doc(hidden)]
pub async fn mark_job_failed(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let claimed = backend.claim(&id).await;
    let error = mock_error();

    assert!(backend
        .mark_job_failed(&id, claimed.attempt, error.clone())
        .await
        .is_ok());

    let job = backend.job(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some(error.message.as_str()));
    assert!(job.result.is_none());
    assert!(job.failed_at.is_some());
    assert_eq!(job.errors.len(), 1);

    let job_error = job.errors.first().unwrap();
    assert_eq!(job_error.attempt, job.attempt);
    assert_eq!(job_error.error_type, error.error_type);
    assert_eq!(job_error.details, error.message);
}

#[doc(hidden)]
pub async fn mark_job_failed_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend.mark_job_failed(&"missing".into(), 1, mock_error()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn heartbeat_requires_active(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(matches!(
        backend.heartbeat(&id, 0).await,
        Err(BackendError::InvalidTransition { .. })
    ));

    let claimed = backend.claim(&id).await;
    assert!(backend.heartbeat(&id, claimed.attempt).await.is_ok());
    assert!(backend.job(&id).await.lease_expires_at >= claimed.lease_expires_at);
}

#[doc(hidden)]
pub async fn query(backend: impl BackendTesting) {
    let waiting = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let active = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let _ = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now().add(TimeDelta::hours(1))))
        .await
        .unwrap();
    backend.claim_and_fail(&waiting).await;
    backend.claim(&active).await;

    assert_eq!(
        backend
            .query(Query::IdEquals("missing".into()))
            .await
            .unwrap()
            .len(),
        0
    );
    assert_eq!(
        backend
            .query(Query::IdEquals(active.clone()))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        backend
            .query(Query::StatusEqual(JobStatus::Waiting))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        backend
            .query(Query::Or(vec![
                Query::StatusEqual(JobStatus::Active),
                Query::StatusEqual(JobStatus::Failed),
            ]))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        backend
            .query(Query::ScheduledAtAfter(Utc::now().add(TimeDelta::minutes(30))))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[doc(hidden)]
pub async fn prune_jobs_max_length(backend: impl BackendTesting) {
    let mut completed = vec![];
    for _ in 0..5 {
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.claim_and_complete(&id).await;
        completed.push(id);
    }
    let failed = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_and_fail(&failed).await;
    let waiting = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let removed = backend
        .prune_jobs(&PruneSpec::max_length(2, JobStatus::Completed))
        .await
        .unwrap();

    assert_eq!(removed, 3);
    let remaining: HashSet<_> = backend
        .query(Query::Not(Box::new(Query::IdEquals("".into()))))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    // The newest completed jobs survive alongside the jobs of other statuses.
    let expected: HashSet<_> = [
        completed[3].clone(),
        completed[4].clone(),
        failed.clone(),
        waiting.clone(),
    ]
    .into_iter()
    .collect();
    assert_eq!(remaining, expected);

    let removed = backend
        .prune_jobs(&PruneSpec {
            status: JobStatus::Waiting,
            prune_by: PruneBy::MaxLength(0),
        })
        .await
        .unwrap();
    assert_eq!(removed, 0);
}

#[doc(hidden)]
pub async fn prune_jobs_max_age(backend: impl BackendTesting) {
    let failed = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_and_fail(&failed).await;
    let completed = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_and_complete(&completed).await;

    let removed = backend
        .prune_jobs(&PruneSpec::max_age(TimeDelta::hours(24), JobStatus::Failed))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let removed = backend
        .prune_jobs(&PruneSpec::max_age(TimeDelta::zero(), JobStatus::Failed))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(backend.get_job(&failed).await.unwrap().is_none());
    assert!(backend.get_job(&completed).await.unwrap().is_some());
}
