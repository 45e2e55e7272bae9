//! Job lifecycle notifications.
//!
//! Workers publish a [`JobEvent`] after each state change has been committed to the backend.
//! Publishing never blocks and never fails: with no subscribers the event is dropped, and a
//! subscriber that falls behind misses the oldest events.
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::{job::JobId, transform::TransformOutput};

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker claimed the job and started an attempt.
    Active { id: JobId, attempt: u16 },
    Completed {
        id: JobId,
        result: TransformOutput,
    },
    /// The attempt failed and the job was rescheduled.
    Retrying {
        id: JobId,
        attempt: u16,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    /// The final attempt failed.
    Failed {
        id: JobId,
        attempt: u16,
        error: String,
    },
}

impl JobEvent {
    pub fn id(&self) -> &JobId {
        match self {
            Self::Active { id, .. }
            | Self::Completed { id, .. }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    #[test]
    fn publish_without_subscribers() {
        let bus = EventBus::default();

        bus.publish(JobEvent::Active {
            id: "job".into(),
            attempt: 1,
        });
    }

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let event = JobEvent::Failed {
            id: "job".into(),
            attempt: 3,
            error: "Failed to process images".to_owned(),
        };

        bus.publish(event.clone());

        assert_eq!(first.try_recv().unwrap(), event);
        assert_eq!(second.try_recv().unwrap(), event);
        assert_matches!(first.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn event_id() {
        let event = JobEvent::Retrying {
            id: "job-7".into(),
            attempt: 1,
            scheduled_at: Utc::now(),
            error: "Failed to process images".to_owned(),
        };

        assert_eq!(event.id().as_str(), "job-7");
    }
}
