//! Accepting uploads as jobs.
use thiserror::Error;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError},
    job::{
        builder::{JobBuilder, JobOptions},
        ImagePayload, JobId,
    },
};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("No image provided")]
    MissingPayload,
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
}

/// Enqueues one job per uploaded image and returns without waiting for it to be processed.
#[derive(Debug, Clone)]
pub struct SubmissionService<B> {
    backend: B,
    options: JobOptions,
}

impl<B> SubmissionService<B>
where
    B: Backend,
{
    /// A service enqueueing with [`JobOptions::default`]: three attempts with exponential
    /// backoff from one second.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            options: Default::default(),
        }
    }

    pub fn with_job_options(self, options: JobOptions) -> Self {
        Self { options, ..self }
    }

    #[instrument(skip_all)]
    pub async fn submit(&self, payload: Option<ImagePayload>) -> Result<JobId, SubmissionError> {
        let payload = payload.ok_or(SubmissionError::MissingPayload)?;
        let original_name = payload.original_name.clone();
        let id = JobBuilder::new(payload)
            .with_options(self.options)
            .enqueue_to_backend(&self.backend)
            .await?;
        tracing::info!(job_id = %id, %original_name, "Enqueued image job {id}");
        Ok(id)
    }
}
