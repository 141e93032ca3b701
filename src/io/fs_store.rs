use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::{ObjectStore, StoreSource};
use crate::error::IoError;

/// Local filesystem implementation of `ObjectStore`.
///
/// Keys map onto paths below the container directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Create a store rooted at the given container directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the container directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, IoError> {
        match fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IoError::Io(format!("{}: {}", key, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, IoError> {
        let dir = self.full_path(prefix);
        let mut entries = Vec::new();

        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(IoError::Io(format!("{}: {}", prefix, e))),
        }

        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// `StoreSource` for a container directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    root: PathBuf,
}

impl FilesystemSource {
    /// Create a source for the given container directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl StoreSource for FilesystemSource {
    type Store = FilesystemStore;

    async fn open_store(&self) -> Result<Self::Store, IoError> {
        if !fs::try_exists(&self.root).await? {
            return Err(IoError::NotFound(self.root.display().to_string()));
        }
        Ok(FilesystemStore::new(&self.root))
    }
}
