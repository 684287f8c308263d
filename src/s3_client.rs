//! S3 Client Module
//!
//! Object storage backend abstraction and its `aws-sdk-s3` implementation.
//! A backend handle is bound to one storage account (endpoint, region,
//! credentials) and addresses objects by bucket and key.

use crate::storage_types::{FileMetadata, StorageConfig};
use crate::{GatewayError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::DateTimeFormat;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Object body as a stream of chunks. Dropping it closes the backend read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Raw object reads against one storage account.
#[async_trait]
pub trait ObjectStorageBackend: Send + Sync {
    /// Returns `GatewayError::NotFound` when the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<FileMetadata>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream>;

    /// `start` and `end` are inclusive byte offsets.
    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream>;

    /// Release pooled connections before the handle is discarded.
    async fn close(&self) {}
}

/// Builds backend handles for storage accounts.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStorageBackend>>;
}

/// Value for the HTTP `Range` header of a backend GET.
pub fn backend_range_header(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end)
}

/// Connector producing [`S3Backend`] handles with static credentials.
#[derive(Debug, Default, Clone)]
pub struct S3Connector;

#[async_trait]
impl BackendConnector for S3Connector {
    async fn connect(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStorageBackend>> {
        Ok(Arc::new(S3Backend::new(config)))
    }
}

/// `aws-sdk-s3` client bound to one storage account
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    endpoint_url: String,
}

impl S3Backend {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "s3-stream-gateway",
        );

        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(config.endpoint_url.clone())
            .force_path_style(true)
            .build();

        info!(
            endpoint = %config.endpoint_url,
            region = %config.region,
            "S3 backend client initialized"
        );

        Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            endpoint_url: config.endpoint_url.clone(),
        }
    }

    fn into_byte_stream(body: aws_sdk_s3::primitives::ByteStream) -> ByteStream {
        Box::pin(futures::stream::unfold(body, |mut body| async move {
            body.next().await.map(|chunk| {
                let chunk = chunk.map_err(|e| {
                    GatewayError::BackendUnavailable(format!("object body read failed: {}", e))
                });
                (chunk, body)
            })
        }))
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<String>) -> Result<ByteStream> {
        debug!(
            endpoint = %self.endpoint_url,
            bucket = %bucket,
            key = %key,
            range = ?range,
            "S3 GetObject"
        );

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                    || e.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if not_found {
                    GatewayError::NotFound(format!("{}/{}", bucket, key))
                } else {
                    GatewayError::BackendUnavailable(format!(
                        "GetObject {}/{} failed: {}",
                        bucket,
                        key,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        Ok(Self::into_byte_stream(output.body))
    }
}

#[async_trait]
impl ObjectStorageBackend for S3Backend {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<FileMetadata> {
        debug!(endpoint = %self.endpoint_url, bucket = %bucket, key = %key, "S3 HeadObject");

        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false)
                    || e.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if not_found {
                    GatewayError::NotFound(format!("{}/{}", bucket, key))
                } else {
                    GatewayError::BackendUnavailable(format!(
                        "HeadObject {}/{} failed: {}",
                        bucket,
                        key,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        Ok(FileMetadata {
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
            last_modified: output
                .last_modified()
                .and_then(|t| t.fmt(DateTimeFormat::HttpDate).ok()),
            etag: output.e_tag().map(str::to_string),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        self.get(bucket, key, None).await
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream> {
        if start > end {
            return Err(GatewayError::InvalidRange(format!(
                "backend range {}-{} is inverted",
                start, end
            )));
        }
        self.get(bucket, key, Some(backend_range_header(start, end)))
            .await
    }
}
