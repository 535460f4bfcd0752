//! Backup storage backends
//!
//! The manager only needs upload/download/list/delete. `LocalStorage`
//! writes blobs under a root directory; `MemoryStorage` backs tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DrError, Result};

/// One stored object, as reported by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub key: String,
    pub backup_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
}

/// Abstract blob store for backups.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn download(&self, key: &str) -> Result<Vec<u8>>;
    async fn list(&self) -> Result<Vec<BackupInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed storage.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are ids generated by the manager; keep them flat.
        self.root.join(key.replace('/', "_"))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(key), bytes).await?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(DrError::BackupNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(BackupInfo {
                key: entry.file_name().to_string_lossy().into_owned(),
                backup_type: None,
                created_at,
                size: Some(metadata.len()),
                checksum: None,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides an object's stored timestamp; point-in-time tests need
    /// backups that appear to come from the past.
    pub fn set_created_at(&self, key: &str, created_at: DateTime<Utc>) {
        if let Some(object) = self.objects.lock().get_mut(key) {
            object.1 = created_at;
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .insert(key.to_string(), (bytes.to_vec(), Utc::now()));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| DrError::BackupNotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut entries: Vec<BackupInfo> = self
            .objects
            .lock()
            .iter()
            .map(|(key, (bytes, created_at))| BackupInfo {
                key: key.clone(),
                backup_type: None,
                created_at: *created_at,
                size: Some(bytes.len() as u64),
                checksum: None,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }
}
