//! The purpose of this module is to alleviate the need to import many of the `[imagequeue]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use imagequeue::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError};
pub use crate::backoff::{BackoffPolicy, BackoffStrategy, Jitter, Strategy};
pub use crate::events::JobEvent;
pub use crate::job::builder::{JobBuilder, JobOptions};
pub use crate::job::{ImagePayload, Job, JobId, JobStatus};
pub use crate::pruner::{PruneSpec, RetentionConfig};
pub use crate::status::{JobStatusReport, StatusError, StatusService};
pub use crate::storage::{FileStorage, LocalFileStorage, StorageError};
pub use crate::submission::{SubmissionError, SubmissionService};
pub use crate::transform::{
    ImageAssets, ImageTransform, TransformError, TransformInput, TransformOutput,
};
pub use crate::{ImageQueue, ImageQueueError, WorkerConfig};
