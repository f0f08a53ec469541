//! Per-owner storage allowance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How much an owner may store, and until when.
///
/// Sizes are tracked in kibibytes; every file is charged `ceil(bytes / 1024)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StorageQuota {
    pub owner_id: i64,

    /// Kibibytes currently charged to the owner. Never negative.
    pub used_space_kb: i64,

    /// Maximum kibibytes the owner may hold.
    pub quota_kb: i64,

    /// Last time the billing path recharged this quota.
    pub charged_at: Option<DateTime<Utc>>,

    /// Writes are refused from this instant on.
    pub expire_at: DateTime<Utc>,

    pub is_deleted: bool,
}

impl StorageQuota {
    pub fn remaining_kb(&self) -> i64 {
        (self.quota_kb - self.used_space_kb).max(0)
    }
}
