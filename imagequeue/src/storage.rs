//! Temporary storage for uploaded originals.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access file storage at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Storage owning uploaded originals until their job reaches a terminal state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Persists an upload and returns its location.
    async fn store_upload(&self, bytes: &[u8]) -> Result<PathBuf, StorageError>;
    /// Deletes a previously stored upload.
    async fn remove_upload(&self, path: &Path) -> Result<(), StorageError>;
}

/// [`FileStorage`] on the local filesystem.
///
/// The upload directory is created on demand and uploads are stored under random names.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    upload_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store_upload(&self, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.upload_dir.clone(),
                source,
            })?;
        let path = self.upload_dir.join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "Stored upload");
        Ok(path)
    }

    async fn remove_upload(&self, path: &Path) -> Result<(), StorageError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|source| StorageError::Io {
                path: path.to_owned(),
                source,
            })
    }
}
