//! Backup manager
//!
//! A backup is `dump -> optional gzip -> AES-256-CBC (random IV prepended)
//! -> SHA-256 checksum -> upload`. The checksum covers the encrypted blob,
//! so verification never needs the key. Compression is recorded in a
//! sidecar metadata record (`<id>.meta.json`), not in the blob itself.

use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::encryption;
use crate::error::{DrError, Result};
use crate::storage::StorageBackend;

const META_SUFFIX: &str = ".meta.json";

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Secret for AES-256-CBC; right-sized to 32 bytes.
    pub encryption_secret: String,
    /// Backups older than this are removed by `cleanup_old_backups`.
    pub retention: Duration,
}

impl BackupConfig {
    pub fn new(encryption_secret: impl Into<String>) -> Self {
        Self {
            encryption_secret: encryption_secret.into(),
            retention: Duration::days(30),
        }
    }
}

/// Per-backup creation options.
#[derive(Debug, Clone)]
pub struct CreateBackupOptions {
    pub backup_type: String,
    pub source: String,
    pub compress: bool,
    pub metadata: HashMap<String, String>,
}

impl Default for CreateBackupOptions {
    fn default() -> Self {
        Self {
            backup_type: "full".to_string(),
            source: "primary".to_string(),
            compress: true,
            metadata: HashMap::new(),
        }
    }
}

/// Progress callback payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupProgress {
    Dumped { bytes: usize },
    Compressed { bytes: usize },
    Encrypted { bytes: usize },
    Uploaded { bytes: usize },
}

/// Completed backup descriptor; also persisted as the metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub backup_type: String,
    pub source: String,
    /// Size of the encrypted blob.
    pub size: u64,
    /// SHA-256 over the encrypted blob, hex-encoded.
    pub checksum: String,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Verification options.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Checksum to compare against; the metadata record's checksum is
    /// used when absent.
    pub expected_checksum: Option<String>,
    /// Also decrypt and hand the plaintext to the restore function.
    pub test_restore: bool,
}

/// Restore options.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub validate_first: bool,
    /// Subset of tables to restore; `None` means everything.
    pub tables: Option<Vec<String>>,
}

/// Encrypted/compressed backup driver over an abstract storage backend.
pub struct BackupManager {
    storage: Arc<dyn StorageBackend>,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(storage: Arc<dyn StorageBackend>, config: BackupConfig) -> Self {
        Self { storage, config }
    }

    /// Creates one backup from the dump function's bytes.
    pub async fn create_backup<F, Fut>(
        &self,
        options: CreateBackupOptions,
        dump: F,
        mut on_progress: Option<&mut (dyn FnMut(BackupProgress) + Send)>,
    ) -> Result<BackupRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<u8>, String>>,
    {
        let id = generate_backup_id();
        info!(backup_id = %id, backup_type = %options.backup_type, "starting backup");

        let plaintext = dump().await.map_err(DrError::Dump)?;
        notify(&mut on_progress, BackupProgress::Dumped {
            bytes: plaintext.len(),
        });

        let payload = if options.compress {
            let compressed = gzip(&plaintext)?;
            notify(&mut on_progress, BackupProgress::Compressed {
                bytes: compressed.len(),
            });
            compressed
        } else {
            plaintext
        };

        let blob = encryption::encrypt(&payload, &self.config.encryption_secret);
        notify(&mut on_progress, BackupProgress::Encrypted { bytes: blob.len() });

        let checksum = sha256_hex(&blob);
        self.storage.upload(&id, &blob).await?;
        notify(&mut on_progress, BackupProgress::Uploaded { bytes: blob.len() });

        let record = BackupRecord {
            id: id.clone(),
            backup_type: options.backup_type,
            source: options.source,
            size: blob.len() as u64,
            checksum,
            compressed: options.compress,
            created_at: Utc::now(),
            metadata: options.metadata,
        };
        self.storage
            .upload(&meta_key(&id), &serde_json::to_vec(&record)?)
            .await?;

        info!(backup_id = %id, size = record.size, checksum = %record.checksum, "backup complete");
        Ok(record)
    }

    /// Downloads the blob and recomputes its checksum; with `test_restore`
    /// the plaintext is also decrypted and handed to `restore_fn`.
    pub async fn verify_backup<F, Fut>(
        &self,
        backup_id: &str,
        options: VerifyOptions,
        restore_fn: Option<F>,
    ) -> Result<()>
    where
        F: FnOnce(Vec<u8>) -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let record = self.load_record(backup_id).await?;
        let blob = self.storage.download(backup_id).await?;

        let expected = options
            .expected_checksum
            .unwrap_or_else(|| record.checksum.clone());
        let actual = sha256_hex(&blob);
        if actual != expected {
            warn!(backup_id, %expected, %actual, "backup checksum mismatch");
            return Err(DrError::ChecksumMismatch { expected, actual });
        }

        if options.test_restore {
            let plaintext = self.decode(&record, &blob)?;
            if let Some(restore_fn) = restore_fn {
                restore_fn(plaintext).await.map_err(DrError::Restore)?;
            }
        }
        debug!(backup_id, "backup verified");
        Ok(())
    }

    /// Restores a backup by id.
    pub async fn restore<F, Fut>(
        &self,
        backup_id: &str,
        options: RestoreOptions,
        restore_fn: F,
    ) -> Result<BackupRecord>
    where
        F: FnOnce(Vec<u8>, Option<Vec<String>>) -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        if options.validate_first {
            self.verify_backup(
                backup_id,
                VerifyOptions::default(),
                None::<fn(Vec<u8>) -> futures::future::Ready<std::result::Result<(), String>>>,
            )
            .await?;
        }

        let record = self.load_record(backup_id).await?;
        let blob = self.storage.download(backup_id).await?;
        let plaintext = self.decode(&record, &blob)?;

        info!(backup_id, size = plaintext.len(), "restoring backup");
        restore_fn(plaintext, options.tables)
            .await
            .map_err(DrError::Restore)?;
        Ok(record)
    }

    /// Restores the newest backup whose `created_at` is at or before
    /// `target_time`.
    pub async fn restore_to_point_in_time<F, Fut>(
        &self,
        target_time: DateTime<Utc>,
        restore_fn: F,
    ) -> Result<BackupRecord>
    where
        F: FnOnce(Vec<u8>, Option<Vec<String>>) -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let candidate = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|record| record.created_at <= target_time)
            .max_by_key(|record| record.created_at)
            .ok_or_else(|| {
                DrError::BackupNotFound(format!("no backup at or before {target_time}"))
            })?;

        info!(backup_id = %candidate.id, created_at = %candidate.created_at, "point-in-time restore");
        self.restore(&candidate.id.clone(), RestoreOptions::default(), restore_fn)
            .await
    }

    /// All backup records, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for info in self.storage.list().await? {
            if !info.key.ends_with(META_SUFFIX) {
                continue;
            }
            let bytes = self.storage.download(&info.key).await?;
            match serde_json::from_slice::<BackupRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(key = %info.key, %err, "skipping unreadable backup record"),
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    /// Deletes backups (blob and record) older than the retention window;
    /// returns how many were removed.
    pub async fn cleanup_old_backups(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.retention;
        let mut removed = 0usize;
        for record in self.list_backups().await? {
            if record.created_at < cutoff {
                self.storage.delete(&record.id).await?;
                self.storage.delete(&meta_key(&record.id)).await?;
                removed += 1;
                info!(backup_id = %record.id, created_at = %record.created_at, "expired backup removed");
            }
        }
        Ok(removed)
    }

    async fn load_record(&self, backup_id: &str) -> Result<BackupRecord> {
        let bytes = self
            .storage
            .download(&meta_key(backup_id))
            .await
            .map_err(|_| DrError::BackupNotFound(backup_id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn decode(&self, record: &BackupRecord, blob: &[u8]) -> Result<Vec<u8>> {
        let payload = encryption::decrypt(blob, &self.config.encryption_secret)?;
        if record.compressed {
            gunzip(&payload)
        } else {
            Ok(payload)
        }
    }
}

fn notify(
    on_progress: &mut Option<&mut (dyn FnMut(BackupProgress) + Send)>,
    progress: BackupProgress,
) {
    if let Some(callback) = on_progress.as_deref_mut() {
        callback(progress);
    }
}

fn meta_key(backup_id: &str) -> String {
    format!("{backup_id}{META_SUFFIX}")
}

fn generate_backup_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let salt: u32 = rand::thread_rng().gen_range(0..0xff_ffff);
    format!("backup-{stamp}-{salt:06x}")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|err| DrError::Compression(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| DrError::Compression(err.to_string()))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| DrError::Compression(err.to_string()))?;
    Ok(out)
}

// COMPREHENSIVE TEST SUITE - ALWAYS AT THE BOTTOM OF EVERY FILE
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn manager(storage: Arc<MemoryStorage>) -> BackupManager {
        BackupManager::new(storage, BackupConfig::new("unit-test-secret"))
    }

    fn dump_of(bytes: &'static [u8]) -> impl FnOnce() -> futures::future::Ready<std::result::Result<Vec<u8>, String>>
    {
        move || futures::future::ready(Ok(bytes.to_vec()))
    }

    async fn patch_created_at(
        storage: &MemoryStorage,
        backup_id: &str,
        created_at: DateTime<Utc>,
    ) {
        let key = meta_key(backup_id);
        let bytes = storage.download(&key).await.unwrap();
        let mut record: BackupRecord = serde_json::from_slice(&bytes).unwrap();
        record.created_at = created_at;
        storage
            .upload(&key, &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backup_restore_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let record = manager
            .create_backup(
                CreateBackupOptions::default(),
                dump_of(b"table rows and settings"),
                None,
            )
            .await
            .unwrap();
        assert!(record.compressed);

        let restored: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&restored);
        manager
            .restore(&record.id, RestoreOptions::default(), move |bytes, tables| {
                assert!(tables.is_none());
                *sink.lock() = bytes;
                futures::future::ready(Ok(()))
            })
            .await
            .unwrap();

        assert_eq!(restored.lock().as_slice(), b"table rows and settings");
    }

    #[tokio::test]
    async fn checksum_matches_encrypted_blob() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let record = manager
            .create_backup(
                CreateBackupOptions {
                    compress: false,
                    ..Default::default()
                },
                dump_of(b"plain payload"),
                None,
            )
            .await
            .unwrap();

        let blob = storage.download(&record.id).await.unwrap();
        assert_eq!(sha256_hex(&blob), record.checksum);
        // The blob is IV || ciphertext: 16-byte IV plus at least one block.
        assert!(blob.len() >= 16 + 16);
    }

    #[tokio::test]
    async fn verify_detects_tampering() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let record = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"data"), None)
            .await
            .unwrap();

        // Flip a byte in the stored blob.
        let mut blob = storage.download(&record.id).await.unwrap();
        blob[20] ^= 0xff;
        storage.upload(&record.id, &blob).await.unwrap();

        let err = manager
            .verify_backup(
                &record.id,
                VerifyOptions::default(),
                None::<fn(Vec<u8>) -> futures::future::Ready<std::result::Result<(), String>>>,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DrError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn verify_with_test_restore_hands_over_plaintext() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let record = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"check me"), None)
            .await
            .unwrap();

        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager
            .verify_backup(
                &record.id,
                VerifyOptions {
                    expected_checksum: None,
                    test_restore: true,
                },
                Some(move |bytes: Vec<u8>| {
                    *sink.lock() = bytes;
                    futures::future::ready(Ok(()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().as_slice(), b"check me");
    }

    #[tokio::test]
    async fn point_in_time_picks_newest_before_target() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let morning = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"morning state"), None)
            .await
            .unwrap();
        let late = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"late state"), None)
            .await
            .unwrap();

        let nine = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let eleven = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        patch_created_at(&storage, &morning.id, nine).await;
        patch_created_at(&storage, &late.id, eleven).await;

        let restored: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&restored);
        let target = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let chosen = manager
            .restore_to_point_in_time(target, move |bytes, _| {
                *sink.lock() = bytes;
                futures::future::ready(Ok(()))
            })
            .await
            .unwrap();

        assert_eq!(chosen.id, morning.id);
        assert_eq!(restored.lock().as_slice(), b"morning state");
    }

    #[tokio::test]
    async fn point_in_time_with_no_candidate_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));
        manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"x"), None)
            .await
            .unwrap();

        let ancient = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let err = manager
            .restore_to_point_in_time(ancient, |_, _| futures::future::ready(Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, DrError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_backups() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(Arc::clone(&storage));

        let old = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"old"), None)
            .await
            .unwrap();
        let fresh = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"fresh"), None)
            .await
            .unwrap();

        patch_created_at(&storage, &old.id, Utc::now() - Duration::days(60)).await;

        let removed = manager.cleanup_old_backups().await.unwrap();
        assert_eq!(removed, 1);

        let remaining = manager.list_backups().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
        assert!(storage.download(&old.id).await.is_err());
    }

    #[tokio::test]
    async fn progress_callback_sees_each_phase() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(storage);

        let mut phases = Vec::new();
        manager
            .create_backup(
                CreateBackupOptions::default(),
                dump_of(b"some data to back up"),
                Some(&mut |progress| phases.push(progress)),
            )
            .await
            .unwrap();

        assert!(matches!(phases[0], BackupProgress::Dumped { .. }));
        assert!(matches!(phases[1], BackupProgress::Compressed { .. }));
        assert!(matches!(phases[2], BackupProgress::Encrypted { .. }));
        assert!(matches!(phases[3], BackupProgress::Uploaded { .. }));
    }

    #[tokio::test]
    async fn local_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(crate::storage::LocalStorage::new(dir.path()));
        let manager = BackupManager::new(storage, BackupConfig::new("secret"));

        let record = manager
            .create_backup(CreateBackupOptions::default(), dump_of(b"on disk"), None)
            .await
            .unwrap();

        let restored: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&restored);
        manager
            .restore(&record.id, RestoreOptions::default(), move |bytes, _| {
                *sink.lock() = bytes;
                futures::future::ready(Ok(()))
            })
            .await
            .unwrap();
        assert_eq!(restored.lock().as_slice(), b"on disk");
    }
}
