use chrono::Utc;

use crate::{
    backend::{Backend, BackendError, EnqueuableJob},
    backoff::BackoffPolicy,
};

use super::{ImagePayload, JobId};

/// Retry options applied to newly submitted jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOptions {
    max_attempts: u16,
    backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::DEFAULT,
        }
    }
}

impl JobOptions {
    pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

    /// Total attempts a job gets, including the first. Values below one are raised to one.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: impl Into<BackoffPolicy>) -> Self {
        Self {
            backoff: backoff.into(),
            ..self
        }
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }
}

pub struct JobBuilder {
    id: Option<JobId>,
    payload: ImagePayload,
    options: JobOptions,
}

impl JobBuilder {
    pub fn new(payload: ImagePayload) -> Self {
        Self {
            id: None,
            payload,
            options: Default::default(),
        }
    }

    /// Uses the given id instead of generating a fresh one.
    pub fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_options(self, options: JobOptions) -> Self {
        Self { options, ..self }
    }

    /// The job is ready to run as soon as it is enqueued.
    pub fn build(self) -> EnqueuableJob {
        EnqueuableJob {
            id: self.id.unwrap_or_else(JobId::generate),
            payload: self.payload,
            max_attempts: self.options.max_attempts,
            backoff: self.options.backoff,
            scheduled_at: Utc::now(),
        }
    }

    pub async fn enqueue_to_backend<B: Backend + ?Sized>(
        self,
        backend: &B,
    ) -> Result<JobId, BackendError> {
        backend.enqueue(self.build()).await
    }
}
