//! Per-owner storage ledger.
//!
//! Every write reserves `ceil(bytes / 1024)` KB before touching a backend.
//! The reservation is a conditional `UPDATE` inside a write transaction, so
//! concurrent reservations for one owner can never push `used_space_kb` past
//! `quota_kb`.

use super::error::{StorageError, StorageResult};
use crate::models::quota::StorageQuota;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

const QUOTA_COLUMNS: &str = "owner_id, used_space_kb, quota_kb, charged_at, expire_at, is_deleted";

/// Kibibytes charged for a payload of `bytes`.
pub fn kb_for(bytes: i64) -> i64 {
    if bytes <= 0 { 0 } else { (bytes + 1023) / 1024 }
}

#[derive(Clone)]
pub struct QuotaLedger {
    db: Arc<SqlitePool>,
}

impl QuotaLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Fetch the owner's row, creating a zero quota on first access.
    pub async fn ensure_exists(&self, owner_id: i64) -> StorageResult<StorageQuota> {
        let mut tx = self.db.begin().await?;
        let quota = ensure_in(&mut tx, owner_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(quota)
    }

    pub async fn reserve_or_fail(&self, owner_id: i64, bytes: i64) -> StorageResult<StorageQuota> {
        self.reserve_kb(owner_id, kb_for(bytes)).await
    }

    /// Reserve an already-rounded amount, e.g. the sum over a copied subtree.
    pub async fn reserve_kb(&self, owner_id: i64, kb: i64) -> StorageResult<StorageQuota> {
        let mut tx = self.db.begin().await?;
        let quota = reserve_in(&mut tx, owner_id, kb, Utc::now()).await?;
        tx.commit().await?;
        Ok(quota)
    }

    pub async fn release(&self, owner_id: i64, bytes: i64) -> StorageResult<StorageQuota> {
        self.release_kb(owner_id, kb_for(bytes)).await
    }

    pub async fn release_kb(&self, owner_id: i64, kb: i64) -> StorageResult<StorageQuota> {
        let mut tx = self.db.begin().await?;
        let quota = release_in(&mut tx, owner_id, kb).await?;
        tx.commit().await?;
        Ok(quota)
    }

    /// Overwrite the allowance; called by the billing path.
    pub async fn recharge(
        &self,
        owner_id: i64,
        quota_kb: i64,
        expire_at: DateTime<Utc>,
    ) -> StorageResult<StorageQuota> {
        if quota_kb < 0 {
            return Err(StorageError::InvalidTarget("quota_kb must not be negative".into()));
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        ensure_in(&mut tx, owner_id, now).await?;
        let quota = sqlx::query_as::<_, StorageQuota>(&format!(
            "UPDATE storage_quota
             SET quota_kb = ?, expire_at = ?, charged_at = ?, is_deleted = 0
             WHERE owner_id = ?
             RETURNING {QUOTA_COLUMNS}"
        ))
        .bind(quota_kb)
        .bind(expire_at)
        .bind(now)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(owner_id, quota_kb, %expire_at, "quota recharged");
        Ok(quota)
    }
}

/// Create the row if missing, then read it. The insert comes first so the
/// transaction holds the database write lock before it reads.
pub(crate) async fn ensure_in(
    conn: &mut SqliteConnection,
    owner_id: i64,
    now: DateTime<Utc>,
) -> StorageResult<StorageQuota> {
    sqlx::query(
        "INSERT INTO storage_quota (owner_id, used_space_kb, quota_kb, charged_at, expire_at, is_deleted)
         VALUES (?, 0, 0, NULL, ?, 0)
         ON CONFLICT(owner_id) DO NOTHING",
    )
    .bind(owner_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let quota = sqlx::query_as::<_, StorageQuota>(&format!(
        "SELECT {QUOTA_COLUMNS} FROM storage_quota WHERE owner_id = ?"
    ))
    .bind(owner_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(quota)
}

pub(crate) async fn reserve_in(
    conn: &mut SqliteConnection,
    owner_id: i64,
    needed_kb: i64,
    now: DateTime<Utc>,
) -> StorageResult<StorageQuota> {
    let quota = ensure_in(conn, owner_id, now).await?;
    let (used_kb, quota_kb) = (quota.used_space_kb, quota.quota_kb);
    let exceeded = move || StorageError::QuotaExceeded {
        requested_kb: needed_kb,
        used_kb,
        quota_kb,
    };

    if quota.used_space_kb + needed_kb > quota.quota_kb {
        return Err(exceeded());
    }
    if now >= quota.expire_at {
        return Err(StorageError::QuotaExpired(quota.expire_at));
    }
    if needed_kb == 0 {
        return Ok(quota);
    }

    let reserved = sqlx::query_as::<_, StorageQuota>(&format!(
        "UPDATE storage_quota
         SET used_space_kb = used_space_kb + ?
         WHERE owner_id = ? AND used_space_kb + ? <= quota_kb AND expire_at > ?
         RETURNING {QUOTA_COLUMNS}"
    ))
    .bind(needed_kb)
    .bind(owner_id)
    .bind(needed_kb)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let reserved = reserved.ok_or_else(exceeded)?;
    debug!(
        owner_id,
        needed_kb,
        used_kb = reserved.used_space_kb,
        remaining_kb = reserved.remaining_kb(),
        "quota reserved"
    );
    Ok(reserved)
}

/// Give back `kb`; usage never drops below zero.
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    owner_id: i64,
    kb: i64,
) -> StorageResult<StorageQuota> {
    ensure_in(conn, owner_id, Utc::now()).await?;
    let quota = sqlx::query_as::<_, StorageQuota>(&format!(
        "UPDATE storage_quota
         SET used_space_kb = MAX(used_space_kb - ?, 0)
         WHERE owner_id = ?
         RETURNING {QUOTA_COLUMNS}"
    ))
    .bind(kb.max(0))
    .bind(owner_id)
    .fetch_one(&mut *conn)
    .await?;
    debug!(owner_id, kb, used_kb = quota.used_space_kb, "quota released");
    Ok(quota)
}
