//! The broker contract between submission, workers and status reporting.
//!
//! A [`Backend`] owns every job record. All state changes go through its transition methods,
//! which enforce the job state machine and reject illegal transitions with
//! [`BackendError::InvalidTransition`].
//!
//! Every transition of an active job carries the `attempt` the caller claimed. Once a lease
//! expires and the job is claimed again, calls made for the earlier attempt are rejected, so a
//! worker that lost its lease can no longer change the job.
//!
//! [`memory::InMemoryBackend`] is the provided implementation. Other implementations can reuse
//! the conformance tests via [`crate::test_suite`].
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;

pub use crate::job::{ErrorType, Job, JobError, JobId, JobStatus};
use crate::{backoff::BackoffPolicy, job::ImagePayload, pruner::PruneSpec, transform::TransformOutput};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait Backend: Send + Sync {
    /// A stream of claimed jobs.
    ///
    /// Every job yielded has already been moved to [`JobStatus::Active`] on behalf of the
    /// subscriber. The stream waits until a job becomes ready.
    async fn subscribe_ready_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>>;
    /// Persists a new job in [`JobStatus::Waiting`].
    ///
    /// Fails with [`BackendError::DuplicateJob`] if the id has ever been issued.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;
    /// Atomically claims one ready job, if there is one.
    async fn fetch_next(&self) -> Result<Option<Job>, BackendError>;
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError>;
    async fn mark_job_complete(
        &self,
        id: &JobId,
        attempt: u16,
        result: TransformOutput,
    ) -> Result<(), BackendError>;
    async fn mark_job_retry(
        &self,
        id: &JobId,
        attempt: u16,
        next_scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError>;
    async fn mark_job_failed(
        &self,
        id: &JobId,
        attempt: u16,
        error: ExecutionError,
    ) -> Result<(), BackendError>;
    /// Extends the lease of an active job.
    async fn heartbeat(&self, id: &JobId, attempt: u16) -> Result<(), BackendError>;
    /// Returns every active job with an expired lease to [`JobStatus::Waiting`], or fails it if
    /// it was on its final attempt. Returns the affected ids.
    async fn reclaim_expired_leases(&self) -> Result<Vec<JobId>, BackendError>;
    /// Removes the terminal jobs matched by `prune_spec`. Returns the number of jobs removed.
    async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<usize, BackendError>;
    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError>;
}

/// A job ready to be inserted into a [`Backend`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub id: JobId,
    pub payload: ImagePayload,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("System in bad state")]
    BadState,
}

/// The error of a single failed attempt as recorded by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
}

/// Filter over job records.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
    IdEquals(JobId),
    StatusEqual(JobStatus),
    ScheduledAtBefore(DateTime<Utc>),
    ScheduledAtAfter(DateTime<Utc>),
}
