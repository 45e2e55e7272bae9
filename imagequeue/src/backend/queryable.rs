use crate::pruner::PruneSpec;

use super::{Job, Query};

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => &job.id == id,
            Query::StatusEqual(status) => job.status == *status,
            Query::ScheduledAtBefore(scheduled_at) => job.scheduled_at < *scheduled_at,
            Query::ScheduledAtAfter(scheduled_at) => job.scheduled_at > *scheduled_at,
        }
    }
}

impl Queryable for PruneSpec {
    fn matches(&self, job: &Job) -> bool {
        self.status.is_terminal() && job.status == self.status
    }
}
