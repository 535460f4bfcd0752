//! # MailWarden Disaster Recovery
//!
//! Out-of-band protection for the system's durable state:
//!
//! - Encrypted, optionally compressed backups with checksum verification
//!   and point-in-time restore
//! - A failover manager that watches the primary endpoint and switches
//!   over after sustained failures
//! - Ordered recovery plans with per-step timeouts, critical/non-critical
//!   steps and best-effort rollback

pub mod backup;
pub mod encryption;
pub mod error;
pub mod failover;
pub mod recovery;
pub mod scheduler;
pub mod storage;

pub use backup::{
    BackupConfig, BackupManager, BackupProgress, BackupRecord, CreateBackupOptions, RestoreOptions,
    VerifyOptions,
};
pub use error::{DrError, Result};
pub use failover::{
    FailoverConfig, FailoverEvent, FailoverManager, FailoverState, HealthCheck, SwitchoverHandler,
};
pub use recovery::{PlanReport, RecoveryPlan, RecoveryStep, StepReport};
pub use scheduler::{BackupScheduler, BackupSource, ScheduleConfig};
pub use storage::{BackupInfo, LocalStorage, MemoryStorage, StorageBackend};
