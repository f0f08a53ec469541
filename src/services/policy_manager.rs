//! Aligns the bucket policy with the permission of individual objects.
//!
//! The backend offers no conditional write on policies, so every edit is a
//! read-modify-write of the whole document. Edits to one `(server, bucket)`
//! are serialised in-process through a `BucketGuard`; callers that touch many
//! keys take the guard once and use `apply_held`/`apply_many`.

use super::{
    error::StorageResult,
    locks::LockRegistry,
    registry::BackendRegistry,
};
use crate::models::{
    file_item::{Permission, ServerKey},
    policy::{BucketPolicy, object_arn},
};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;

/// Exclusive right to edit one bucket's policy.
pub struct BucketGuard {
    server: ServerKey,
    bucket: String,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl BucketGuard {
    pub fn server(&self) -> ServerKey {
        self.server
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

pub struct PolicyManager {
    registry: Arc<BackendRegistry>,
    locks: LockRegistry<(ServerKey, String)>,
}

impl PolicyManager {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            locks: LockRegistry::new(),
        }
    }

    pub async fn lock_bucket(&self, server: ServerKey, bucket: &str) -> BucketGuard {
        let guard = self.locks.lock((server, bucket.to_string())).await;
        BucketGuard {
            server,
            bucket: bucket.to_string(),
            _guard: guard,
        }
    }

    /// Make `key` public or private in the bucket policy, or drop it from
    /// both managed statements when `just_remove` is set.
    pub async fn apply(
        &self,
        server: ServerKey,
        bucket: &str,
        key: &str,
        permission: Permission,
        just_remove: bool,
    ) -> StorageResult<()> {
        let guard = self.lock_bucket(server, bucket).await;
        self.apply_held(&guard, key, permission, just_remove).await
    }

    pub async fn apply_held(
        &self,
        guard: &BucketGuard,
        key: &str,
        permission: Permission,
        just_remove: bool,
    ) -> StorageResult<()> {
        self.apply_many(guard, [key], permission, just_remove).await
    }

    /// Apply the same change to every key in a single document rewrite.
    pub async fn apply_many<'k>(
        &self,
        guard: &BucketGuard,
        keys: impl IntoIterator<Item = &'k str>,
        permission: Permission,
        just_remove: bool,
    ) -> StorageResult<()> {
        let backend = self.registry.resolve(guard.server)?;
        let current = backend.bucket_policy(&guard.bucket).await?;
        let original = BucketPolicy::parse(current.as_deref())?;

        let mut policy = original.clone();
        let mut touched = 0usize;
        for key in keys {
            let arn = object_arn(&guard.bucket, key);
            let listed = policy.permission_of(&arn);
            if just_remove {
                touched += usize::from(listed.is_some());
                policy.revoke(&arn);
            } else {
                touched += usize::from(listed != Some(permission));
                policy.grant(&arn, permission);
            }
        }

        if policy == original {
            return Ok(());
        }

        debug!(
            server = %guard.server,
            bucket = %guard.bucket,
            touched,
            %permission,
            just_remove,
            "rewriting bucket policy"
        );
        let document = if policy.is_empty() {
            None
        } else {
            Some(policy.to_json()?)
        };
        backend
            .set_bucket_policy(&guard.bucket, document.as_deref())
            .await
    }
}
