//! Single-writer manifest persistence.

use super::record::RunManifest;
use crate::errors::ManifestIoError;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Owns a manifest and its file.
///
/// Every mutation goes through [`ManifestStore::update`], which applies the
/// change and writes the whole document before releasing the lock. Writes
/// go to a temporary sibling file that is then renamed over the target, so
/// readers see either the previous or the new version.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    manifest: Mutex<RunManifest>,
}

impl ManifestStore {
    /// Wraps a manifest without touching the filesystem.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, manifest: RunManifest) -> Self {
        Self {
            path: path.into(),
            manifest: Mutex::new(manifest),
        }
    }

    /// Creates the store and writes the initial document.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestIoError`] if the file cannot be written.
    pub async fn create(path: impl Into<PathBuf>, manifest: RunManifest) -> Result<Self, ManifestIoError> {
        let store = Self::new(path, manifest);
        store.persist().await?;
        Ok(store)
    }

    /// Opens an existing manifest for further updates.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestIoError`] if the file is missing or invalid.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ManifestIoError> {
        let path = path.into();
        let manifest = load(&path).await?;
        Ok(Self::new(path, manifest))
    }

    /// Manifest file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies a change and persists the result.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestIoError`] if the write fails. The in-memory change
    /// is kept.
    pub async fn update<F, R>(&self, change: F) -> Result<R, ManifestIoError>
    where
        F: FnOnce(&mut RunManifest) -> R,
    {
        let mut manifest = self.manifest.lock().await;
        let result = change(&mut manifest);
        manifest.touch();
        write_atomic(&self.path, &manifest).await?;
        Ok(result)
    }

    /// Writes the current document.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestIoError`] if the write fails.
    pub async fn persist(&self) -> Result<(), ManifestIoError> {
        let manifest = self.manifest.lock().await;
        write_atomic(&self.path, &manifest).await
    }

    /// A copy of the current document.
    pub async fn snapshot(&self) -> RunManifest {
        self.manifest.lock().await.clone()
    }
}

/// Reads a manifest file.
///
/// # Errors
///
/// Returns [`ManifestIoError`] if the file cannot be read or parsed.
pub async fn load(path: &Path) -> Result<RunManifest, ManifestIoError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| ManifestIoError::new(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| ManifestIoError::new(path, e))
}

async fn write_atomic(path: &Path, manifest: &RunManifest) -> Result<(), ManifestIoError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ManifestIoError::new(path, e))?;
    }
    let body = serde_json::to_vec_pretty(manifest).map_err(|e| ManifestIoError::new(path, e))?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| ManifestIoError::new(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ManifestIoError::new(path, e))?;
    debug!(path = %path.display(), status = %manifest.status, "Manifest persisted");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
