//! Object backend primitives.
//!
//! `ObjectBackend` is the narrow S3-compatible surface the catalog relies on.
//! `Backend` wraps one implementation with its server key, public host and
//! request deadline, and turns backend failures into `StorageError`s that
//! name the operation and the key in flight.

use super::error::{StorageError, StorageResult};
use crate::models::file_item::ServerKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::{
    collections::HashSet,
    future::Future,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// Object payload streamed out of a backend.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Keys under a prefix, yielded lazily. One pass per call.
pub type KeyStream = BoxStream<'static, BackendResult<String>>;

/// Failure reported by a backend implementation. Only the two error codes
/// the service reacts to are distinguished; everything else is opaque.
#[derive(Debug, Error, PartialEq)]
pub enum BackendFailure {
    #[error("NoSuchKey")]
    NoSuchKey,
    #[error("NoSuchBucketPolicy")]
    NoSuchBucketPolicy,
    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendFailure>;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStat {
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Store `body` under `key`, replacing any existing object.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> BackendResult<()>;

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<ByteStream>;

    /// `Err(NoSuchKey)` when the object is absent.
    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectStat>;

    /// Succeeds when the object is already absent.
    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()>;

    /// Server-side copy of a single object within one bucket.
    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> BackendResult<()>;

    /// Every key under `prefix`, recursively.
    fn list(&self, bucket: &str, prefix: &str) -> KeyStream;

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> BackendResult<String>;

    async fn ensure_bucket(&self, bucket: &str) -> BackendResult<()>;

    /// `Err(NoSuchBucketPolicy)` when the bucket carries no policy.
    async fn get_bucket_policy(&self, bucket: &str) -> BackendResult<String>;

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> BackendResult<()>;

    async fn delete_bucket_policy(&self, bucket: &str) -> BackendResult<()>;
}

/// One configured backend, addressed by its server key.
pub struct Backend {
    server: ServerKey,
    host: String,
    inner: Arc<dyn ObjectBackend>,
    timeout: Duration,
    ensured_buckets: Mutex<HashSet<String>>,
}

impl Backend {
    pub fn new(
        server: ServerKey,
        host: impl Into<String>,
        inner: Arc<dyn ObjectBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            server,
            host: host.into(),
            inner,
            timeout,
            ensured_buckets: Mutex::new(HashSet::new()),
        }
    }

    pub fn server(&self) -> ServerKey {
        self.server
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Deterministic, unsigned URL of an object.
    pub fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("https://{}/{}/{}", self.host, bucket, key)
    }

    /// Run one backend round-trip under the request deadline.
    async fn call<T, F>(&self, op: &'static str, bucket: &str, key: &str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BackendFailure::NoSuchKey)) => {
                Err(StorageError::NotFound(format!("object `{}/{}`", bucket, key)))
            }
            Ok(Err(failure)) => Err(StorageError::Backend {
                server: self.server,
                op,
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: failure.to_string(),
            }),
            Err(_) => Err(StorageError::BackendTimeout {
                server: self.server,
                op,
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }

    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        debug!(server = %self.server, bucket, key, size = body.len(), "put object");
        self.call("put", bucket, key, self.inner.put(bucket, key, body, content_type))
            .await
    }

    pub async fn get(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        self.call("get", bucket, key, self.inner.get(bucket, key))
            .await
    }

    /// `None` when the object does not exist.
    pub async fn stat(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectStat>> {
        match self.call("stat", bucket, key, self.inner.stat(bucket, key)).await {
            Ok(stat) => Ok(Some(stat)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        Ok(self.stat(bucket, key).await?.is_some())
    }

    pub async fn remove(&self, bucket: &str, key: &str) -> StorageResult<()> {
        debug!(server = %self.server, bucket, key, "remove object");
        self.call("remove", bucket, key, self.inner.remove(bucket, key))
            .await
    }

    pub async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> StorageResult<()> {
        debug!(server = %self.server, bucket, src_key, dst_key, "copy object");
        self.call("copy", bucket, src_key, self.inner.copy(bucket, src_key, dst_key))
            .await
    }

    /// Lazily list keys under `prefix`; every page fetch carries the deadline.
    pub fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, StorageResult<String>> {
        let keys = self.inner.list(bucket, prefix);
        let server = self.server;
        let timeout = self.timeout;
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        stream::unfold(Some(keys), move |state| {
            let bucket = bucket.clone();
            let prefix = prefix.clone();
            async move {
                let mut keys = state?;
                match tokio::time::timeout(timeout, keys.next()).await {
                    Ok(Some(Ok(key))) => Some((Ok(key), Some(keys))),
                    Ok(Some(Err(failure))) => Some((
                        Err(StorageError::Backend {
                            server,
                            op: "list",
                            bucket,
                            key: prefix,
                            message: failure.to_string(),
                        }),
                        None,
                    )),
                    Ok(None) => None,
                    Err(_) => Some((
                        Err(StorageError::BackendTimeout {
                            server,
                            op: "list",
                            bucket,
                            key: prefix,
                        }),
                        None,
                    )),
                }
            }
        })
        .boxed()
    }

    pub async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        self.call("presign", bucket, key, self.inner.presign_get(bucket, key, ttl))
            .await
    }

    /// Create the bucket once per process; later calls are answered locally.
    pub async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        if self.ensured().contains(bucket) {
            return Ok(());
        }
        self.call("ensure_bucket", bucket, "", self.inner.ensure_bucket(bucket))
            .await?;
        self.ensured().insert(bucket.to_string());
        Ok(())
    }

    /// Current policy document, `None` when the bucket has none.
    pub async fn bucket_policy(&self, bucket: &str) -> StorageResult<Option<String>> {
        match tokio::time::timeout(self.timeout, self.inner.get_bucket_policy(bucket)).await {
            Ok(Ok(policy)) => Ok(Some(policy)),
            Ok(Err(BackendFailure::NoSuchBucketPolicy)) => Ok(None),
            Ok(Err(failure)) => Err(StorageError::Backend {
                server: self.server,
                op: "get_bucket_policy",
                bucket: bucket.to_string(),
                key: String::new(),
                message: failure.to_string(),
            }),
            Err(_) => Err(StorageError::BackendTimeout {
                server: self.server,
                op: "get_bucket_policy",
                bucket: bucket.to_string(),
                key: String::new(),
            }),
        }
    }

    /// Write the policy document; `None` removes the policy from the bucket.
    pub async fn set_bucket_policy(&self, bucket: &str, policy: Option<&str>) -> StorageResult<()> {
        match policy {
            Some(policy) => {
                self.call(
                    "set_bucket_policy",
                    bucket,
                    "",
                    self.inner.set_bucket_policy(bucket, policy),
                )
                .await
            }
            None => {
                self.call(
                    "delete_bucket_policy",
                    bucket,
                    "",
                    self.inner.delete_bucket_policy(bucket),
                )
                .await
            }
        }
    }

    fn ensured(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ensured_buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
