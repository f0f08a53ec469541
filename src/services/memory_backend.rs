//! In-process object backend with S3 semantics, for local runs and tests.

use super::backend::{BackendFailure, BackendResult, ByteStream, KeyStream, ObjectBackend, ObjectStat};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    etag: String,
}

#[derive(Default, Debug)]
struct MemoryBucket {
    objects: BTreeMap<String, StoredObject>,
    policy: Option<String>,
}

#[derive(Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, MemoryBucket>>,
    /// Operations forced to fail, by operation name.
    failures: Mutex<HashSet<&'static str>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, MemoryBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, op: &'static str) -> BackendResult<()> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failures.contains(op) {
            return Err(BackendFailure::Other(format!("injected {} failure", op)));
        }
        Ok(())
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut MemoryBucket) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut buckets = self.buckets();
        let entry = buckets
            .get_mut(bucket)
            .ok_or_else(|| BackendFailure::Other(format!("NoSuchBucket: {}", bucket)))?;
        f(entry)
    }

    /// Make every later call of `op` fail until `heal` is called.
    #[cfg(test)]
    pub fn fail_on(&self, op: &'static str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op);
    }

    #[cfg(test)]
    pub fn heal(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Snapshot of every key currently stored in `bucket`.
    #[cfg(test)]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets()
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn policy(&self, bucket: &str) -> crate::models::policy::BucketPolicy {
        let document = self.buckets().get(bucket).and_then(|b| b.policy.clone());
        crate::models::policy::BucketPolicy::parse(document.as_deref())
            .expect("stored policy parses")
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> BackendResult<()> {
        self.check("put")?;
        let etag = format!("{:x}", md5::compute(&body));
        self.with_bucket(bucket, |b| {
            b.objects.insert(
                key.to_string(),
                StoredObject {
                    data: body,
                    content_type: content_type.to_string(),
                    etag,
                },
            );
            Ok(())
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<ByteStream> {
        self.check("get")?;
        let data = self.with_bucket(bucket, |b| {
            b.objects
                .get(key)
                .map(|object| object.data.clone())
                .ok_or(BackendFailure::NoSuchKey)
        })?;
        Ok(stream::once(async move { Ok::<_, io::Error>(data) }).boxed())
    }

    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectStat> {
        self.check("stat")?;
        self.with_bucket(bucket, |b| {
            b.objects
                .get(key)
                .map(|object| ObjectStat {
                    size_bytes: object.data.len() as i64,
                    content_type: Some(object.content_type.clone()),
                    etag: Some(object.etag.clone()),
                })
                .ok_or(BackendFailure::NoSuchKey)
        })
    }

    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()> {
        self.check("remove")?;
        self.with_bucket(bucket, |b| {
            b.objects.remove(key);
            Ok(())
        })
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> BackendResult<()> {
        self.check("copy")?;
        self.with_bucket(bucket, |b| {
            let object = b
                .objects
                .get(src_key)
                .cloned()
                .ok_or(BackendFailure::NoSuchKey)?;
            b.objects.insert(dst_key.to_string(), object);
            Ok(())
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> KeyStream {
        let listed = self.check("list").and_then(|_| {
            self.with_bucket(bucket, |b| {
                Ok(b.objects
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>())
            })
        });
        match listed {
            Ok(keys) => stream::iter(keys.into_iter().map(Ok)).boxed(),
            Err(failure) => stream::once(async move { Err(failure) }).boxed(),
        }
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> BackendResult<String> {
        self.check("presign")?;
        self.with_bucket(bucket, |b| {
            if b.objects.contains_key(key) {
                Ok(())
            } else {
                Err(BackendFailure::NoSuchKey)
            }
        })?;
        let signed_at = Utc::now().timestamp();
        let signature = md5::compute(format!("{}/{}/{}/{}", bucket, key, signed_at, ttl.as_secs()));
        Ok(format!(
            "memory://{}/{}?X-Amz-Date={}&X-Amz-Expires={}&X-Amz-Signature={:x}",
            bucket,
            key,
            signed_at,
            ttl.as_secs(),
            signature
        ))
    }

    async fn ensure_bucket(&self, bucket: &str) -> BackendResult<()> {
        self.check("ensure_bucket")?;
        self.buckets().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> BackendResult<String> {
        self.check("get_bucket_policy")?;
        self.with_bucket(bucket, |b| {
            b.policy.clone().ok_or(BackendFailure::NoSuchBucketPolicy)
        })
    }

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> BackendResult<()> {
        self.check("set_bucket_policy")?;
        self.with_bucket(bucket, |b| {
            b.policy = Some(policy.to_string());
            Ok(())
        })
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> BackendResult<()> {
        self.check("delete_bucket_policy")?;
        self.with_bucket(bucket, |b| {
            b.policy = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let backend = MemoryBackend::new();
        backend.ensure_bucket("b").await.unwrap();
        for key in ["u1/d/", "u1/d/x", "u1/d/y/z", "u1/dx", "u2/d/x"] {
            backend
                .put("b", key, Bytes::new(), "application/octet-stream")
                .await
                .unwrap();
        }

        let keys: Vec<String> = backend.list("b", "u1/d/").try_collect().await.unwrap();
        assert_eq!(keys, vec!["u1/d/", "u1/d/x", "u1/d/y/z"]);
    }

    #[tokio::test]
    async fn missing_objects_report_no_such_key() {
        let backend = MemoryBackend::new();
        backend.ensure_bucket("b").await.unwrap();

        assert_eq!(backend.stat("b", "nope").await, Err(BackendFailure::NoSuchKey));
        assert_eq!(
            backend.copy("b", "nope", "dst").await,
            Err(BackendFailure::NoSuchKey)
        );
        assert_eq!(backend.remove("b", "nope").await, Ok(()));
        assert_eq!(
            backend.get_bucket_policy("b").await,
            Err(BackendFailure::NoSuchBucketPolicy)
        );
    }

    #[tokio::test]
    async fn put_requires_bucket() {
        let backend = MemoryBackend::new();
        let err = backend
            .put("missing", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFailure::Other(msg) if msg.contains("NoSuchBucket")));
    }

    #[tokio::test]
    async fn presign_embeds_expiry() {
        let backend = MemoryBackend::new();
        backend.ensure_bucket("b").await.unwrap();
        backend
            .put("b", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        let url = backend
            .presign_get("b", "k", Duration::from_secs(90))
            .await
            .unwrap();
        assert!(url.starts_with("memory://b/k?"));
        assert!(url.contains("X-Amz-Expires=90"));
    }
}
