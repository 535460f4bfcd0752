//! Backup scheduler
//!
//! Runs `create_backup` on a fixed interval and applies retention cleanup
//! after every run. The host supplies the dump through [`BackupSource`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::backup::{BackupManager, CreateBackupOptions};

/// Produces the bytes to back up; implemented by the host service.
#[async_trait]
pub trait BackupSource: Send + Sync {
    fn name(&self) -> &str;
    async fn dump(&self) -> std::result::Result<Vec<u8>, String>;
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub compress: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            compress: true,
        }
    }
}

/// Interval-driven backup loop.
pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    source: Arc<dyn BackupSource>,
    config: ScheduleConfig,
    running: Arc<AtomicBool>,
}

impl BackupScheduler {
    pub fn new(
        manager: Arc<BackupManager>,
        source: Arc<dyn BackupSource>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            manager,
            source,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One scheduled cycle: back up, then enforce retention.
    pub async fn run_once(&self) {
        let source = Arc::clone(&self.source);
        let options = CreateBackupOptions {
            backup_type: "scheduled".to_string(),
            source: source.name().to_string(),
            compress: self.config.compress,
            metadata: Default::default(),
        };
        match self
            .manager
            .create_backup(options, || async move { source.dump().await }, None)
            .await
        {
            Ok(record) => info!(backup_id = %record.id, "scheduled backup complete"),
            Err(err) => {
                error!(%err, "scheduled backup failed");
                return;
            }
        }
        match self.manager.cleanup_old_backups().await {
            Ok(removed) if removed > 0 => info!(removed, "retention cleanup"),
            Ok(_) => {}
            Err(err) => error!(%err, "retention cleanup failed"),
        }
    }

    /// Starts the interval loop; idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.interval);
            ticker.tick().await;
            while scheduler.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if scheduler.running.load(Ordering::SeqCst) {
                    scheduler.run_once().await;
                }
            }
        });
        info!(interval_s = self.config.interval.as_secs(), "backup scheduler started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("backup scheduler stopped");
    }
}
