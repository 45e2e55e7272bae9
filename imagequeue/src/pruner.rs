//! Retention of terminal jobs.
//!
//! Completed and failed jobs are kept around so their status can still be reported, but not
//! forever. A [`RetentionConfig`] holds a [`cron::Schedule`] saying when the pruner runs and a
//! list of [`PruneSpec`]s saying what it removes on each run.
//!
//! Only terminal jobs are ever removed: a spec naming a non-terminal status matches nothing.
//!
//! # Example
//!
//! Keep the newest 100 completed jobs and drop failed jobs older than a day, checking every
//! minute:
//!
//! ```
//! # use imagequeue::prelude::*;
//! # use std::str::FromStr;
//! let config = RetentionConfig::new(cron::Schedule::from_str("0 * * * * *").unwrap())
//!     .with_pruners(PruneSpec::defaults());
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

use crate::job::JobStatus;

/// When and how terminal jobs are removed.
///
/// Once constructed it should be passed to [`crate::ImageQueue::with_job_pruner`].
pub struct RetentionConfig {
    schedule: cron::Schedule,
    max_concurrency: Option<usize>,
    pruners: Vec<PruneSpec>,
}

impl RetentionConfig {
    /// A config with no pruners scheduled to run on `schedule`.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_concurrency: Some(10),
            pruners: Default::default(),
        }
    }

    /// Limits how many prune specs are applied simultaneously.
    pub fn with_max_concurrency(self, max_concurrency: Option<usize>) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    pub fn with_pruner(mut self, pruner: PruneSpec) -> Self {
        self.pruners.push(pruner);
        self
    }

    pub fn with_pruners(mut self, pruners: impl IntoIterator<Item = PruneSpec>) -> Self {
        self.pruners.extend(pruners);
        self
    }

    pub fn pruners(&self) -> &[PruneSpec] {
        &self.pruners
    }
}

/// A single retention rule for consumption by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneSpec {
    /// The status of the jobs affected by this rule.
    pub status: JobStatus,
    pub prune_by: PruneBy,
}

impl PruneSpec {
    /// Number of completed jobs kept by [`PruneSpec::defaults`].
    pub const DEFAULT_COMPLETED_MAX_COUNT: u32 = 100;
    /// Age after which failed jobs are dropped by [`PruneSpec::defaults`].
    pub const DEFAULT_FAILED_MAX_AGE: TimeDelta = TimeDelta::hours(24);

    /// Removes jobs of `status` that finished more than `age` ago.
    pub const fn max_age(age: TimeDelta, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxAge(age),
        }
    }

    /// Keeps only the `length` most recently finished jobs of `status`.
    pub const fn max_length(length: u32, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxLength(length),
        }
    }

    /// Keep the newest 100 completed jobs, drop failed jobs after 24 hours.
    pub const fn defaults() -> [Self; 2] {
        [
            Self::max_length(Self::DEFAULT_COMPLETED_MAX_COUNT, JobStatus::Completed),
            Self::max_age(Self::DEFAULT_FAILED_MAX_AGE, JobStatus::Failed),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    MaxAge(TimeDelta),
    MaxLength(u32),
}
