//! Public and presigned URLs for catalog nodes.

use super::{
    error::{StorageError, StorageResult},
    registry::BackendRegistry,
};
use crate::models::file_item::FileItem;
use std::{sync::Arc, time::Duration};

pub struct UrlSynthesizer {
    registry: Arc<BackendRegistry>,
    presign_max_ttl: Duration,
}

impl UrlSynthesizer {
    pub fn new(registry: Arc<BackendRegistry>, presign_max_ttl: Duration) -> Self {
        Self {
            registry,
            presign_max_ttl,
        }
    }

    /// `https://{host}/{bucket}/{key}` of the node's backend. Never signed.
    pub fn public_url(&self, item: &FileItem) -> StorageResult<String> {
        let backend = self.registry.resolve(item.server_key)?;
        Ok(backend.public_url(&item.bucket, &item.object_key))
    }

    /// Time-limited GET URL. The TTL must be between one second and the
    /// configured maximum.
    pub async fn presign(&self, item: &FileItem, ttl: Duration) -> StorageResult<String> {
        if ttl < Duration::from_secs(1) || ttl > self.presign_max_ttl {
            return Err(StorageError::InvalidTarget(format!(
                "presign ttl must be between 1 and {} seconds",
                self.presign_max_ttl.as_secs()
            )));
        }
        let backend = self.registry.resolve(item.server_key)?;
        backend
            .presign_get(&item.bucket, &item.object_key, ttl)
            .await
    }
}
