//! Persistent election metadata: (current_term, voted_for).
//!
//! The durability contract: every mutation is flushed before any RPC that
//! reveals the new value is sent. [`FileMetadataStore`] implements the
//! contract with write-to-temp + fsync + atomic rename.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::protocol::PeerId;
use crate::protocol::Term;
use crate::Result;
use crate::StorageError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMetadata {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
}

impl Default for PersistedMetadata {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
        }
    }
}

#[cfg_attr(test, automock)]
pub trait MetadataStore: Send + Sync + 'static {
    /// `None` on first boot.
    fn load(&self) -> Result<Option<PersistedMetadata>>;

    /// Must be durable before returning.
    fn save(&self, metadata: &PersistedMetadata) -> Result<()>;
}

/// Metadata file with atomic-rename semantics.
pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn create_parent_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| StorageError::Path {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self) -> Result<Option<PersistedMetadata>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| StorageError::Path {
            path: self.path.clone(),
            source: e,
        })?;
        let metadata = bincode::deserialize(&bytes).map_err(StorageError::Bincode)?;
        Ok(Some(metadata))
    }

    fn save(&self, metadata: &PersistedMetadata) -> Result<()> {
        Self::create_parent_dir(&self.path)?;

        let tmp = self.tmp_path();
        let bytes = bincode::serialize(metadata).map_err(StorageError::Bincode)?;
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::Path {
                path: tmp.clone(),
                source: e,
            })?;
            file.write_all(&bytes).map_err(StorageError::Io)?;
            file.sync_all().map_err(StorageError::Io)?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::Path {
            path: self.path.clone(),
            source: e,
        })?;

        debug!(?metadata, path = %self.path.display(), "metadata persisted");
        Ok(())
    }
}
