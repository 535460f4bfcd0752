//! Job model

use chrono::{DateTime, Utc};
use common::{ParsedEmail, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority; lower rank dequeues first. No aging: a steady stream
/// of critical jobs will starve low-priority ones by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// One unit of scoring work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub tenant_id: TenantId,
    pub email: ParsedEmail,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(tenant_id: impl Into<TenantId>, email: ParsedEmail, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            email,
            priority,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Dequeue ordering: lexicographic on (priority rank, created_at).
    pub fn order_key(&self) -> (u8, DateTime<Utc>) {
        (self.priority.rank(), self.created_at)
    }
}
