//! Local persistence for scripts and application manifests.
//!
//! Layout under the working directory:
//!
//! ```text
//! {workingDir}/{scriptFileName}                    agent-mode script
//! {workingDir}/{relAppsDir}/{appConfigsFile}       accepted manifest
//! {workingDir}/{relAppsDir}/{appConfigsFile}.digest
//! {workingDir}/{relAppsDir}/{appDir}/{scriptName}  one script per app
//! ```
//!
//! Writes go to a temporary sibling and are renamed into place. Content read
//! back from disk is trusted; it was verified when it was written.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use fleet_proto::AppDescriptor;
use fleet_reconcile::{ManifestDigest, ScriptContent};
use thiserror::Error;
use tracing::debug;

/// Errors from local storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest at {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsafe path component: {0:?}")]
    UnsafePath(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reject anything that could escape the directory it is joined onto.
fn relative_component(value: &str) -> Result<&Path, StorageError> {
    let path = Path::new(value);
    let safe = !value.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(StorageError::UnsafePath(value.to_string()))
    }
}

/// Read a file, treating absence as `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Write `bytes` to `path` via a temporary sibling and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(io_error(&temp_path))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(io_error(path))?;
    Ok(())
}

// =============================================================================
// Single Script
// =============================================================================

/// Storage for one script file (agent mode).
#[derive(Debug, Clone)]
pub struct ScriptStore {
    path: PathBuf,
}

impl ScriptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last known good content, if any.
    pub async fn load(&self) -> Result<Option<ScriptContent>, StorageError> {
        Ok(read_optional(&self.path)
            .await?
            .map(ScriptContent::from_local))
    }

    pub async fn save(&self, content: &ScriptContent) -> Result<(), StorageError> {
        write_atomic(&self.path, content.bytes()).await
    }
}

// =============================================================================
// Application Storage
// =============================================================================

/// Storage for the fleet's applications.
#[derive(Debug, Clone)]
pub struct AppStorage {
    root: PathBuf,
    manifest_path: PathBuf,
    digest_path: PathBuf,
}

impl AppStorage {
    /// `root` is `{workingDir}/{relAppsDir}`.
    pub fn new(root: impl Into<PathBuf>, manifest_file: &str) -> Self {
        let root = root.into();
        let manifest_path = root.join(manifest_file);
        let digest_path = root.join(format!("{}.digest", manifest_file));
        Self {
            root,
            manifest_path,
            digest_path,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one application. An empty `appDir` falls back to the
    /// application name.
    pub fn app_dir(&self, app: &AppDescriptor) -> Result<PathBuf, StorageError> {
        let dir = if app.app_dir.is_empty() {
            &app.app_name
        } else {
            &app.app_dir
        };
        Ok(self.root.join(relative_component(dir)?))
    }

    pub fn script_path(&self, app: &AppDescriptor) -> Result<PathBuf, StorageError> {
        Ok(self
            .app_dir(app)?
            .join(relative_component(&app.script_name)?))
    }

    /// Script content of one application, if present on disk.
    pub async fn load_script(&self, app: &AppDescriptor) -> Result<Option<ScriptContent>, StorageError> {
        let path = self.script_path(app)?;
        Ok(read_optional(&path).await?.map(ScriptContent::from_local))
    }

    pub async fn save_script(&self, app: &AppDescriptor, content: &ScriptContent) -> Result<(), StorageError> {
        let path = self.script_path(app)?;
        write_atomic(&path, content.bytes()).await?;
        debug!(app = %app.app_name, path = %path.display(), "Script saved");
        Ok(())
    }

    /// Remove an application's directory. A missing directory is fine.
    pub async fn remove_app(&self, app: &AppDescriptor) -> Result<(), StorageError> {
        let dir = self.app_dir(app)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }

    /// The accepted manifest. A missing file reads as empty.
    pub async fn load_manifest(&self) -> Result<Vec<AppDescriptor>, StorageError> {
        let Some(bytes) = read_optional(&self.manifest_path).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Manifest {
            path: self.manifest_path.clone(),
            source,
        })
    }

    /// Digest recorded alongside the accepted manifest.
    pub async fn load_digest(&self) -> Result<Option<ManifestDigest>, StorageError> {
        let bytes = read_optional(&self.digest_path).await?;
        Ok(bytes
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .filter(|s| !s.trim().is_empty())
            .map(|s| ManifestDigest::from_persisted(&s)))
    }

    /// Persist the accepted manifest and its digest.
    pub async fn save_manifest(
        &self,
        apps: &[AppDescriptor],
        digest: &ManifestDigest,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(apps).map_err(|source| StorageError::Manifest {
            path: self.manifest_path.clone(),
            source,
        })?;
        write_atomic(&self.manifest_path, &json).await?;
        write_atomic(&self.digest_path, digest.as_str().as_bytes()).await
    }
}
