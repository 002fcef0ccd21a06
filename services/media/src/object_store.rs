use crate::clock::Clock;
use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Failures talking to object storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage request timed out")]
    Timeout,

    #[error("Storage request failed: {0}")]
    Request(String),

    #[error("Failed to presign URL: {0}")]
    Presign(String),
}

/// Time-limited URL granting read access to one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlGrant {
    pub target: String,
    pub issued_at: SystemTime,
    pub ttl: Duration,
}

impl SignedUrlGrant {
    pub fn expires_at(&self) -> SystemTime {
        self.issued_at + self.ttl
    }

    /// Whether the URL is still accepted by the store at `now`
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now >= self.issued_at && now < self.expires_at()
    }
}

/// Read model of an object in the bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObjectRef {
    pub key: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// Set when the bucket is also served from a public base URL
    pub public_url: Option<String>,
}

/// Gateway to the bucket holding protected media
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// HEAD lookup; `false` only when the store reports not found
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Presign a GET for `key`. Does not check that the object exists.
    async fn issue_signed_url(&self, key: &str, ttl: Duration)
        -> Result<SignedUrlGrant, StoreError>;

    async fn get_metadata(&self, key: &str) -> Result<StorageObjectRef, StoreError>;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Unsigned URL for objects served from a public bucket domain
    fn public_url(&self, key: &str) -> Option<String>;
}

/// S3-compatible gateway (R2, MinIO, AWS)
pub struct S3Gateway {
    client: S3Client,
    bucket: String,
    public_url_base: Option<String>,
    request_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl S3Gateway {
    /// Create a new gateway from storage configuration
    pub async fn new(
        config: &StorageConfig,
        request_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Static keys for R2; otherwise the default provider chain
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "media-service-static",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "Object store gateway initialized"
        );

        Ok(Self::from_client(
            client,
            config.bucket.clone(),
            config.public_url_base.clone(),
            request_timeout,
            clock,
        ))
    }

    /// Wrap an already configured client
    pub fn from_client(
        client: S3Client,
        bucket: String,
        public_url_base: Option<String>,
        request_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            bucket,
            public_url_base,
            request_timeout,
            clock,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let result = self
            .timed(
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .await?;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StoreError::Request(DisplayErrorContext(&e).to_string()))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn issue_signed_url(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUrlGrant, StoreError> {
        let issued_at = self.clock.now();

        let presigning_config = PresigningConfig::builder()
            .start_time(issued_at)
            .expires_in(ttl)
            .build()
            .map_err(|e| StoreError::Presign(e.to_string()))?;

        let presigned = self
            .timed(
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .presigned(presigning_config),
            )
            .await?
            .map_err(|e| StoreError::Presign(DisplayErrorContext(&e).to_string()))?;

        debug!(key = %key, ttl_secs = ttl.as_secs(), "Issued signed URL");

        Ok(SignedUrlGrant {
            target: presigned.uri().to_string(),
            issued_at,
            ttl,
        })
    }

    #[instrument(skip(self))]
    async fn get_metadata(&self, key: &str) -> Result<StorageObjectRef, StoreError> {
        let result = self
            .timed(
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .await?;

        let head = match result {
            Ok(head) => head,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                return Err(StoreError::Request(DisplayErrorContext(&e).to_string()));
            }
        };

        Ok(StorageObjectRef {
            key: key.to_string(),
            content_type: head.content_type().map(String::from),
            size: head.content_length().and_then(|len| u64::try_from(len).ok()),
            last_modified: head
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            etag: head.e_tag().map(String::from),
            public_url: None,
        })
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .timed(
                    self.client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(prefix)
                        .set_continuation_token(continuation_token.take())
                        .send(),
                )
                .await?
                .map_err(|e| StoreError::Request(DisplayErrorContext(&e).to_string()))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_url_base
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key))
    }
}
