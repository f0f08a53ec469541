//! Rename, move and copy over key prefixes.
//!
//! A directory is a zero-byte marker object whose key ends in `/`; its
//! contents are every key sharing that prefix. Transfers are sequences of
//! per-object copy/policy/remove steps, not atomic. A failed transfer leaves
//! source and partial destination in place; re-running it in
//! `TransferMode::Resume` finishes the job because every step is idempotent
//! per key. The source marker is moved last, so its presence means the
//! transfer has not completed.

use super::{
    backend::Backend,
    error::{StorageError, StorageResult},
    policy_manager::{BucketGuard, PolicyManager},
    registry::BackendRegistry,
};
use crate::models::file_item::{Permission, ServerKey};
use futures::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

/// How to treat a destination that already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// The destination must not exist.
    Fresh,
    /// An existing destination is debris of an interrupted run of the same transfer.
    Resume,
}

/// Permission to apply to each transferred key, by source key.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPermissions {
    default: Permission,
    overrides: HashMap<String, Permission>,
}

impl KeyPermissions {
    pub fn uniform(permission: Permission) -> Self {
        Self {
            default: permission,
            overrides: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, permission: Permission) {
        self.overrides.insert(key.into(), permission);
    }

    pub fn for_key(&self, key: &str) -> Permission {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }
}

pub fn is_directory_key(key: &str) -> bool {
    key.ends_with('/')
}

/// Last path segment of a key, keeping the trailing `/` of directories.
pub fn basename(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &key[pos + 1..],
        None => key,
    }
}

/// Re-root `key` from under `old_prefix` to under `new_prefix`.
pub fn rebase(key: &str, old_prefix: &str, new_prefix: &str) -> String {
    format!("{}{}", new_prefix, &key[old_prefix.len()..])
}

pub struct DirectoryEngine {
    registry: Arc<BackendRegistry>,
    policies: Arc<PolicyManager>,
}

impl DirectoryEngine {
    pub fn new(registry: Arc<BackendRegistry>, policies: Arc<PolicyManager>) -> Self {
        Self { registry, policies }
    }

    /// Move `old_key` (a file, or a directory with everything under it) to
    /// `new_key`. Returns the public URL of `new_key`.
    pub async fn rename_or_move(
        &self,
        server: ServerKey,
        bucket: &str,
        old_key: &str,
        new_key: &str,
        permissions: &KeyPermissions,
        mode: TransferMode,
    ) -> StorageResult<String> {
        let backend = self.registry.resolve(server)?;
        if old_key == new_key {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` is already at its destination",
                old_key
            )));
        }
        if is_directory_key(old_key) != is_directory_key(new_key) {
            return Err(StorageError::InvalidTarget(format!(
                "cannot turn `{}` into `{}`",
                old_key, new_key
            )));
        }
        if is_directory_key(old_key) && new_key.starts_with(old_key) {
            return Err(StorageError::InvalidTarget(format!(
                "cannot move `{}` into itself",
                old_key
            )));
        }

        let guard = self.policies.lock_bucket(server, bucket).await;
        let source = backend.stat(bucket, old_key).await?;
        let target_exists = backend.exists(bucket, new_key).await?;
        match (source.is_some(), target_exists, mode) {
            (false, true, TransferMode::Resume) => {
                info!(%server, bucket, old_key, new_key, "transfer already complete");
                return Ok(backend.public_url(bucket, new_key));
            }
            (false, _, _) => {
                return Err(StorageError::NotFound(format!("object `{}/{}`", bucket, old_key)));
            }
            (true, true, TransferMode::Fresh) => {
                return Err(StorageError::AlreadyExists(format!("object `{}/{}`", bucket, new_key)));
            }
            _ => {}
        }

        if is_directory_key(old_key) {
            let mut keys = backend.list(bucket, old_key);
            let mut moved = 0usize;
            while let Some(key) = keys.next().await {
                let key = key?;
                if key == old_key {
                    continue;
                }
                let target = rebase(&key, old_key, new_key);
                self.move_one(backend, &guard, &key, &target, permissions.for_key(&key))
                    .await?;
                moved += 1;
            }
            self.move_one(backend, &guard, old_key, new_key, permissions.for_key(old_key))
                .await?;
            debug!(%server, bucket, old_key, new_key, moved, "directory moved");
        } else {
            self.move_one(backend, &guard, old_key, new_key, permissions.for_key(old_key))
                .await?;
            if let Some(stat) = source {
                debug!(
                    %server,
                    bucket,
                    old_key,
                    new_key,
                    size_bytes = stat.size_bytes,
                    content_type = ?stat.content_type,
                    etag = ?stat.etag,
                    "file moved"
                );
            }
        }

        Ok(backend.public_url(bucket, new_key))
    }

    /// Copy `source_key` (and, for a directory, everything under it) into
    /// `destination_directory`, keeping its basename. Returns the public URL
    /// of the copy.
    pub async fn copy_into(
        &self,
        server: ServerKey,
        bucket: &str,
        source_key: &str,
        destination_directory: &str,
        permissions: &KeyPermissions,
        mode: TransferMode,
    ) -> StorageResult<String> {
        let backend = self.registry.resolve(server)?;
        if !is_directory_key(destination_directory) {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` is not a directory",
                destination_directory
            )));
        }
        if is_directory_key(source_key) && destination_directory.starts_with(source_key) {
            return Err(StorageError::InvalidTarget(format!(
                "cannot copy `{}` into itself",
                source_key
            )));
        }
        let target = format!("{}{}", destination_directory, basename(source_key));

        let guard = self.policies.lock_bucket(server, bucket).await;
        if !backend.exists(bucket, source_key).await? {
            return Err(StorageError::NotFound(format!("object `{}/{}`", bucket, source_key)));
        }
        if mode == TransferMode::Fresh && backend.exists(bucket, &target).await? {
            return Err(StorageError::AlreadyExists(format!("object `{}/{}`", bucket, target)));
        }

        if is_directory_key(source_key) {
            let mut keys = backend.list(bucket, source_key);
            let mut copied = 0usize;
            while let Some(key) = keys.next().await {
                let key = key?;
                let destination = rebase(&key, source_key, &target);
                self.copy_one(backend, &guard, &key, &destination, permissions.for_key(&key))
                    .await?;
                copied += 1;
            }
            debug!(%server, bucket, source_key, %target, copied, "directory copied");
        } else {
            self.copy_one(backend, &guard, source_key, &target, permissions.for_key(source_key))
                .await?;
        }

        Ok(backend.public_url(bucket, &target))
    }

    async fn move_one(
        &self,
        backend: &Backend,
        guard: &BucketGuard,
        from: &str,
        to: &str,
        permission: Permission,
    ) -> StorageResult<()> {
        let bucket = guard.bucket();
        let steps = async {
            backend.copy(bucket, from, to).await?;
            self.policies.apply_held(guard, to, permission, false).await?;
            self.policies.apply_held(guard, from, permission, true).await?;
            backend.remove(bucket, from).await
        };
        steps.await.inspect_err(|err| {
            warn!(
                server = %guard.server(),
                bucket,
                key = from,
                target = to,
                error = %err,
                "move interrupted; re-run to converge"
            )
        })
    }

    async fn copy_one(
        &self,
        backend: &Backend,
        guard: &BucketGuard,
        from: &str,
        to: &str,
        permission: Permission,
    ) -> StorageResult<()> {
        let bucket = guard.bucket();
        let steps = async {
            backend.copy(bucket, from, to).await?;
            self.policies.apply_held(guard, to, permission, false).await
        };
        steps.await.inspect_err(|err| {
            warn!(
                server = %guard.server(),
                bucket,
                key = from,
                target = to,
                error = %err,
                "copy interrupted; re-run to converge"
            )
        })
    }
}
