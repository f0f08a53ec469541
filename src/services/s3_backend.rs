//! S3-compatible backend built on `aws-sdk-s3`.
//!
//! Addressing is path-style so MinIO and similar servers work unchanged.

use super::backend::{BackendFailure, BackendResult, ByteStream, KeyStream, ObjectBackend, ObjectStat};
use crate::config::BackendSettings;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Builder, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream as SdkByteStream,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::{collections::VecDeque, fmt::Debug, time::Duration};
use tokio_util::io::ReaderStream;

pub struct S3Backend {
    client: Client,
}

impl S3Backend {
    pub fn new(settings: &BackendSettings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "site-storage",
        );
        let scheme = if settings.use_ssl { "https" } else { "http" };

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .endpoint_url(format!("{}://{}", scheme, settings.host))
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
        }
    }
}

/// Map an SDK error onto the codes the service cares about.
fn classify<E, R>(err: SdkError<E, R>) -> BackendFailure
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => BackendFailure::NoSuchKey,
        Some("NoSuchBucketPolicy") => BackendFailure::NoSuchBucketPolicy,
        _ => BackendFailure::Other(DisplayErrorContext(&err).to_string()),
    }
}

/// Copy sources are `bucket/key` with each key segment URL-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", bucket, encoded)
}

struct ListState {
    client: Client,
    bucket: String,
    prefix: String,
    pending: VecDeque<String>,
    continuation: Option<String>,
    exhausted: bool,
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> BackendResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(ReaderStream::new(output.body.into_async_read()).boxed())
    }

    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectStat> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(ObjectStat {
            size_bytes: output.content_length().unwrap_or(0),
            content_type: output.content_type().map(str::to_string),
            etag: output.e_tag().map(|etag| etag.trim_matches('"').to_string()),
        })
    }

    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()> {
        match self
            .client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)
        {
            Ok(_) | Err(BackendFailure::NoSuchKey) => Ok(()),
            Err(failure) => Err(failure),
        }
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> BackendResult<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .key(dst_key)
            .copy_source(copy_source(bucket, src_key))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> KeyStream {
        let state = ListState {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            pending: VecDeque::new(),
            continuation: None,
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(key) = state.pending.pop_front() {
                    return Some((Ok(key), state));
                }
                if state.exhausted {
                    return None;
                }

                let mut request = state
                    .client
                    .list_objects_v2()
                    .bucket(&state.bucket)
                    .prefix(&state.prefix);
                if let Some(token) = state.continuation.take() {
                    request = request.continuation_token(token);
                }

                match request.send().await {
                    Ok(page) => {
                        state.pending.extend(
                            page.contents()
                                .iter()
                                .filter_map(|object| object.key().map(str::to_string)),
                        );
                        state.continuation = page.next_continuation_token().map(str::to_string);
                        state.exhausted = state.continuation.is_none();
                    }
                    Err(err) => {
                        state.exhausted = true;
                        return Some((Err(classify(err)), state));
                    }
                }
            }
        })
        .boxed()
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> BackendResult<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|err| BackendFailure::Other(format!("presigning config: {}", err)))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(classify)?;
        Ok(request.uri().to_string())
    }

    async fn ensure_bucket(&self, bucket: &str) -> BackendResult<()> {
        match self
            .client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.code(),
                    Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists")
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn get_bucket_policy(&self, bucket: &str) -> BackendResult<String> {
        let output = self
            .client
            .get_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        output
            .policy()
            .map(str::to_string)
            .ok_or(BackendFailure::NoSuchBucketPolicy)
    }

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> BackendResult<()> {
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> BackendResult<()> {
        self.client
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_encodes_segments_but_keeps_separators() {
        assert_eq!(copy_source("b", "u7/my file.txt"), "b/u7/my%20file.txt");
        assert_eq!(copy_source("b", "u7/d/"), "b/u7/d/");
    }
}
