//! Upload directory.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An upload written under a hidden temporary name. It only takes its own
/// name once committed, so a rejected upload never replaces a file in use.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
    file_name: String,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `bytes` next to the uploads without touching the sanitized
    /// `name` yet.
    pub async fn stage(&self, name: &str, bytes: &[u8]) -> Result<StagedUpload, StorageError> {
        let file_name = sanitize(name)?;
        let path = self.dir.join(format!(".{}-{}", Uuid::new_v4(), file_name));
        tokio::fs::write(&path, bytes).await?;
        debug!("Staged upload {:?} ({} bytes)", path, bytes.len());
        Ok(StagedUpload { path, file_name })
    }

    /// Moves a staged upload to its own name, replacing any earlier upload
    /// with the same name.
    pub async fn commit(&self, staged: StagedUpload) -> Result<PathBuf, StorageError> {
        let path = self.dir.join(&staged.file_name);
        tokio::fs::rename(&staged.path, &path).await?;
        debug!("Stored upload {:?}", path);
        Ok(path)
    }

    pub async fn discard(&self, staged: StagedUpload) {
        if let Err(e) = tokio::fs::remove_file(&staged.path).await {
            warn!("Failed to remove staged upload {:?}: {}", staged.path, e);
        }
    }

    /// Path of a previously uploaded file.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let file_name = sanitize(name)?;
        let path = self.dir.join(&file_name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StorageError::NotFound(file_name))
        }
    }
}

/// Reduces `name` to its final path component.
fn sanitize(name: &str) -> Result<String, StorageError> {
    let file_name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(file_name.to_string())
}
