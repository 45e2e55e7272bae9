use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, ExecutionError},
    backoff::Strategy,
    events::{EventBus, JobEvent},
    storage::FileStorage,
    transform::{ImageTransform, TransformError, TransformInput, TransformOutput},
    WorkerConfig,
};

use super::{ErrorType, Job};

pub(crate) struct JobRunner<B: Backend> {
    backend: B,
    transform: Arc<dyn ImageTransform>,
    storage: Arc<dyn FileStorage>,
    events: EventBus,
    timeout: Option<Duration>,
    heartbeat_interval: Duration,
}

impl<B> JobRunner<B>
where
    B: Backend + 'static,
{
    pub(crate) fn new(
        backend: B,
        transform: Arc<dyn ImageTransform>,
        storage: Arc<dyn FileStorage>,
        events: EventBus,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            backend,
            transform,
            storage,
            events,
            timeout: config.timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt))]
    pub async fn execute_job(&self, job: Job) {
        let job_id = job.id.clone();
        self.events.publish(JobEvent::Active {
            id: job_id.clone(),
            attempt: job.attempt,
        });
        tracing::debug!(%job_id, "Executing job {job_id}");

        let input = TransformInput {
            path: job.payload.path.clone(),
            id: job_id.clone(),
        };
        let transform = self.transform.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(
            async move {
                let fut = transform.transform(input);
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, fut).await,
                    None => Ok(fut.await),
                }
            }
            .in_current_span(),
        );

        let Some(result) = self.await_with_heartbeat(&job, handle).await else {
            return;
        };
        match result {
            Ok(Ok(Ok(output))) => self.handle_job_complete(&job, output).await,
            Ok(Ok(Err(error))) => self.handle_job_error(&job, error).await,
            Ok(Err(_elapsed)) => {
                let timeout = timeout.unwrap_or_default();
                self.handle_job_error(&job, timeout).await
            }
            Err(error) => self.handle_job_error(&job, error).await,
        }
    }

    /// Keeps the lease of `job` alive until the transform task finishes.
    ///
    /// Returns `None` once the claim is lost, after aborting the transform. The job then belongs
    /// to whichever worker claimed it next, so nothing more may be recorded for this attempt.
    async fn await_with_heartbeat<T>(
        &self,
        job: &Job,
        mut handle: JoinHandle<T>,
    ) -> Option<Result<T, JoinError>> {
        let job_id = &job.id;
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                result = &mut handle => return Some(result),
                _ = heartbeat.tick() => match self.backend.heartbeat(job_id, job.attempt).await {
                    Ok(()) => {}
                    Err(err @ (BackendError::InvalidTransition { .. } | BackendError::JobNotFound(_))) => {
                        tracing::warn!(
                            ?err,
                            %job_id,
                            "Lost the claim on job {job_id}, abandoning attempt {}",
                            job.attempt,
                        );
                        handle.abort();
                        return None;
                    }
                    Err(err) => {
                        tracing::warn!(?err, %job_id, "Failed to extend lease of job {job_id}")
                    }
                },
            }
        }
    }

    async fn handle_job_complete(&self, job: &Job, output: TransformOutput) {
        let job_id = &job.id;
        tracing::debug!(%job_id, "Job complete {job_id}");
        if let Err(err) = self
            .backend
            .mark_job_complete(job_id, job.attempt, output.clone())
            .await
        {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to mark job {job_id} as complete, error: {err:?}",
            );
            return;
        }
        self.remove_upload(job).await;
        self.events.publish(JobEvent::Completed {
            id: job_id.clone(),
            result: output,
        });
    }

    async fn handle_job_error(&self, job: &Job, error: impl Into<ExecutionError>) {
        let job_id = &job.id;
        let error = error.into();
        if job.is_final_attempt() {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} has failed with {}: error type: {}",
                error.message,
                error.error_type,
            );
            let message = error.message.clone();
            if let Err(err) = self
                .backend
                .mark_job_failed(job_id, job.attempt, error)
                .await {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                );
                return;
            }
            self.remove_upload(job).await;
            self.events.publish(JobEvent::Failed {
                id: job_id.clone(),
                attempt: job.attempt,
                error: message,
            });
        } else {
            let delay = job.backoff.backoff(job.attempt);
            let scheduled_at = Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be retried in {delay}: error type: {}, message: {}",
                error.error_type,
                error.message
            );
            let message = error.message.clone();
            if let Err(err) = self
                .backend
                .mark_job_retry(job_id, job.attempt, scheduled_at, error)
                .await
            {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} for retry, error: {err:?}",
                );
                return;
            }
            self.events.publish(JobEvent::Retrying {
                id: job_id.clone(),
                attempt: job.attempt,
                scheduled_at,
                error: message,
            });
        }
    }

    /// Best effort: a leftover upload never changes the job state.
    async fn remove_upload(&self, job: &Job) {
        let job_id = &job.id;
        let _ = self
            .storage
            .remove_upload(&job.payload.path)
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    ?err,
                    %job_id,
                    "Failed to remove upload of job {job_id}: {err}",
                )
            });
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<TransformError> for ExecutionError {
    fn from(value: TransformError) -> Self {
        if let Some(cause) = value.cause() {
            tracing::debug!(%cause, "Transform failed");
        }
        Self {
            error_type: ErrorType::Transform,
            message: value.to_string(),
        }
    }
}

impl From<Duration> for ExecutionError {
    fn from(value: Duration) -> Self {
        let timeout = TimeDelta::from_std(value).unwrap_or(TimeDelta::MAX);
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {timeout}"),
        }
    }
}
