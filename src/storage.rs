//! Whole-document persistence for the session store and instance directory.
//!
//! Each store owns one named JSON document and rewrites it completely on
//! every mutation. [`FileStorage`] writes to a temporary file and renames it
//! into place, so a reader never observes a half-written document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Backend holding named documents.
pub trait DocumentStorage: Send + Sync {
    /// Read a document. `Ok(None)` when it was never written.
    fn read(&self, name: &str) -> Result<Option<String>, StoreError>;

    /// Replace a document.
    fn write(&self, name: &str, contents: &str) -> Result<(), StoreError>;
}

/// Documents stored as `<dir>/<name>.json`.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl DocumentStorage for FileStorage {
    fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                crate::config::check_config_permissions(&path);
                Ok(Some(contents))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), StoreError> {
        let path = self.path_for(name);
        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        std::fs::write(&tmp, contents).map_err(write_err)?;
        restrict_permissions(&tmp).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }
}

/// Documents may carry session tokens; keep them owner-only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, e.g. to simulate state left by a previous run.
    pub fn with_document(self, name: &str, contents: &str) -> Self {
        self.documents
            .lock()
            .insert(name.to_string(), contents.to_string());
        self
    }

    pub fn document(&self, name: &str) -> Option<String> {
        self.documents.lock().get(name).cloned()
    }
}

impl DocumentStorage for MemoryStorage {
    fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.document(name))
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), StoreError> {
        self.documents
            .lock()
            .insert(name.to_string(), contents.to_string());
        Ok(())
    }
}
