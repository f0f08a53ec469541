//! Core data models for the site storage service.
//!
//! `FileItem` and `StorageQuota` map to database rows via `sqlx::FromRow`;
//! `BucketPolicy` models the JSON document kept on each object backend.

pub mod caller;
pub mod file_item;
pub mod policy;
pub mod quota;
