//! Job records and their lifecycle.
//!
//! ```text
//! waiting ──▶ active ──▶ completed
//!    ▲          │
//!    │          ├──────▶ failed
//!    │          ▼
//!    └─────── delayed
//! ```
//!
//! `completed` and `failed` are terminal. An `active` job whose lease expires is returned to
//! `waiting` by the backend.
use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{backoff::BackoffPolicy, transform::TransformOutput};

pub mod builder;
pub(crate) mod runner;

/// Opaque unique identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uploaded original a job transforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub payload: ImagePayload,
    pub attempt: u16,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    pub result: Option<TransformOutput>,
    pub failure_reason: Option<String>,
    pub errors: Vec<JobError>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// When the job reached its terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Completed => self.completed_at,
            JobStatus::Failed => self.failed_at,
            _ => None,
        }
    }
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub attempt: u16,
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorType {
    Transform,
    Panic,
    Timeout,
    LeaseExpired,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform => f.write_str("transform"),
            Self::Panic => f.write_str("panic"),
            Self::Timeout => f.write_str("timeout"),
            Self::LeaseExpired => f.write_str("lease_expired"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let statuses = [
            (JobStatus::Waiting, "waiting"),
            (JobStatus::Active, "active"),
            (JobStatus::Completed, "completed"),
            (JobStatus::Failed, "failed"),
            (JobStatus::Delayed, "delayed"),
        ];

        for (status, expected) in statuses {
            assert_eq!(serde_json::to_value(status).unwrap(), expected);
            assert_eq!(status.to_string(), expected);
        }
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn job_id_displays_raw_value() {
        let id = JobId::from("nonexistent-123");

        assert_eq!(id.to_string(), "nonexistent-123");
        assert_eq!(serde_json::to_value(&id).unwrap(), "nonexistent-123");
    }
}
