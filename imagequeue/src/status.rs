//! Read-only view of job progress.
use serde::Serialize;
use thiserror::Error;

use crate::{
    backend::{Backend, BackendError},
    job::{Job, JobId, JobStatus},
    transform::TransformOutput,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Job not found in the system.")]
    NotFound(JobId),
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
}

/// What a client sees when polling a job.
///
/// `data` is only present once the job completed and `error` only once it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusReport {
    pub id: JobId,
    pub status: JobStatus,
    pub processed: bool,
    pub data: Option<TransformOutput>,
    pub error: Option<String>,
}

impl From<Job> for JobStatusReport {
    fn from(job: Job) -> Self {
        let processed = job.status == JobStatus::Completed;
        let failed = job.status == JobStatus::Failed;
        Self {
            id: job.id,
            status: job.status,
            processed,
            data: job.result.filter(|_| processed),
            error: job.failure_reason.filter(|_| failed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusService<B> {
    backend: B,
}

impl<B> StatusService<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobStatusReport, StatusError> {
        self.backend
            .get_job(id)
            .await?
            .map(JobStatusReport::from)
            .ok_or_else(|| StatusError::NotFound(id.clone()))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{
            memory::InMemoryBackend,
            testing::{mock_output, BackendTesting},
            EnqueuableJob,
        },
        transform::ImageAssets,
    };

    #[tokio::test]
    async fn waiting_job() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        let report = StatusService::new(backend).get_status(&id).await.unwrap();

        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "id": id.as_str(),
                "status": "waiting",
                "processed": false,
                "data": null,
                "error": null,
            })
        );
    }

    #[tokio::test]
    async fn active_job() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.claim(&id).await;

        let report = StatusService::new(backend).get_status(&id).await.unwrap();

        assert_eq!(report.status, JobStatus::Active);
        assert!(!report.processed);
    }

    #[tokio::test]
    async fn completed_job() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.claim_and_complete(&id).await;

        let report = StatusService::new(backend).get_status(&id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert!(report.processed);
        assert_eq!(report.data, Some(mock_output(&id)));
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn failed_job() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
            .await
            .unwrap();
        backend.claim_and_fail(&id).await;

        let report = StatusService::new(backend).get_status(&id).await.unwrap();

        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "id": id.as_str(),
                "status": "failed",
                "processed": false,
                "data": null,
                "error": "Failed to process images",
            })
        );
    }

    #[tokio::test]
    async fn unknown_job() {
        let service = StatusService::new(InMemoryBackend::new());

        assert_matches!(
            service.get_status(&"nonexistent-123".into()).await,
            Err(StatusError::NotFound(id)) if id.as_str() == "nonexistent-123"
        );
    }

    #[test]
    fn report_hides_stale_fields() {
        let mut job = Job::raw_job().with_status(JobStatus::Delayed);
        job.result = Some(TransformOutput::new(ImageAssets::for_job(&job.id)));
        job.failure_reason = Some("Failed to process images".to_owned());

        let report = JobStatusReport::from(job);

        assert_eq!(report.data, None);
        assert_eq!(report.error, None);
    }
}
