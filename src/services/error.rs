use crate::models::file_item::ServerKey;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("owner {owner_id} may not access {target}")]
    Unauthorized { owner_id: i64, target: String },
    #[error("quota exceeded: {requested_kb} KB requested, {used_kb} of {quota_kb} KB used")]
    QuotaExceeded {
        requested_kb: i64,
        used_kb: i64,
        quota_kb: i64,
    },
    #[error("quota expired at {0}")]
    QuotaExpired(DateTime<Utc>),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("backend {server} failed to {op} `{bucket}/{key}`: {message}")]
    Backend {
        server: ServerKey,
        op: &'static str,
        bucket: String,
        key: String,
        message: String,
    },
    #[error("backend {server} timed out during {op} on `{bucket}/{key}`")]
    BackendTimeout {
        server: ServerKey,
        op: &'static str,
        bucket: String,
        key: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed bucket policy: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
