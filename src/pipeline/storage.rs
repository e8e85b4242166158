//! Object storage seam for original files and encrypted artifacts.
//!
//! Keys are relative, '/'-separated paths such as `materials/notes.pdf` or
//! `encrypted/<material>/<artifact>.enc`.

use crate::OfflineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Blob storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Read an object, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OfflineError>;

    /// Write an object, replacing any previous content.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), OfflineError>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool, OfflineError>;
}

/// In-memory object storage.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OfflineError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), OfflineError> {
        self.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, OfflineError> {
        Ok(self.lock().contains_key(key))
    }
}

/// Filesystem-backed object storage rooted at a directory.
///
/// Writes go to a temp file and are renamed into place, so readers never
/// see a partial object.
#[derive(Debug, Clone)]
pub struct FileObjectStorage {
    root: PathBuf,
}

impl FileObjectStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, OfflineError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| OfflineError::Storage(format!("Failed to create storage root: {}", e)))?;
        Ok(Self { root })
    }

    /// Resolve a key to a path inside the root.
    fn object_path(&self, key: &str) -> Result<PathBuf, OfflineError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(OfflineError::Storage(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for FileObjectStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OfflineError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OfflineError::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), OfflineError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OfflineError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, &data)
            .await
            .map_err(|e| OfflineError::Storage(format!("Failed to write temp file: {}", e)))?;

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(OfflineError::Storage(format!("Failed to rename object: {}", e)));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, OfflineError> {
        let path = self.object_path(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| OfflineError::Storage(format!("Failed to stat {}: {}", key, e)))
    }
}
