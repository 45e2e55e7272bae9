//! The contract between the workers and the function producing the derived image assets.
//!
//! Workers hand the transform a [`TransformInput`] (the stored upload and the job id) and expect
//! either a complete [`TransformOutput`] or a single normalized [`TransformError`]. An
//! implementation must never report success with a partial asset set.
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Input handed to an [`ImageTransform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInput {
    /// Location of the original upload.
    pub path: PathBuf,
    /// The job the transform runs for. Used to name the derived assets.
    pub id: JobId,
}

/// The result stored on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub success: bool,
    pub assets: ImageAssets,
}

impl TransformOutput {
    pub fn new(assets: ImageAssets) -> Self {
        Self {
            success: true,
            assets,
        }
    }
}

/// Locations of the derived assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAssets {
    /// Full size WebP rendition.
    pub webp: PathBuf,
    /// Width constrained JPEG rendition.
    pub mobile: PathBuf,
    /// Tiny preview inlined as a `data:image/...;base64,` URI.
    pub placeholder: String,
}

/// The single error reported by a failing transform.
///
/// Callers cannot tell which step failed; the underlying cause is kept as the error source for
/// logging only.
#[derive(Debug, Error)]
#[error("Failed to process images")]
pub struct TransformError {
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransformError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }

    /// The underlying cause, if any.
    pub fn cause(&self) -> Option<String> {
        self.source.as_ref().map(ToString::to_string)
    }
}

impl Default for TransformError {
    fn default() -> Self {
        Self { source: None }
    }
}

/// Produces the derived assets for a single job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageTransform: Send + Sync {
    async fn transform(&self, input: TransformInput) -> Result<TransformOutput, TransformError>;
}
