//! S3-compatible client implementation.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::multipart::{MultipartStore, UploadSession};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Bucket artifacts are written to
    pub bucket: String,
    /// Region ("auto" for most S3-compatible providers)
    pub region: String,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("S3_ENDPOINT_URL")
                .map_err(|_| StorageError::config_error("S3_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("S3_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("S3_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("S3_SECRET_ACCESS_KEY not set"))?,
            bucket: std::env::var("S3_BUCKET")
                .map_err(|_| StorageError::config_error("S3_BUCKET not set"))?,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "auto".to_string()),
        })
    }
}

/// Object storage client.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vidpipe",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    /// Configured bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Check that the bucket is reachable with these credentials.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("Bucket connectivity check failed: {}", e)))?;

        info!("Storage connectivity check passed for bucket {}", self.bucket);
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for S3Client {
    async fn initiate(&self, bucket: &str, key: &str, content_type: &str) -> StorageResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::initiate_failed(e.to_string()))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::initiate_failed("response carried no upload id"))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: i32,
        body: Vec<u8>,
    ) -> StorageResult<String> {
        let len = body.len();
        let response = self
            .client
            .upload_part()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part_number)
            .content_length(len as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                StorageError::upload_failed(format!("part {} of {}: {}", part_number, session.key, e))
            })?;

        debug!(key = %session.key, part_number, bytes = len, "Uploaded part");

        response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::upload_failed(format!("part {} returned no e-tag", part_number)))
    }

    async fn complete(&self, session: &UploadSession) -> StorageResult<()> {
        let parts = session
            .sorted_parts()
            .into_iter()
            .map(|p| CompletedPart::builder().part_number(p.part_number).e_tag(p.e_tag).build())
            .collect::<Vec<_>>();

        let upload = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        self.client
            .complete_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| StorageError::complete_failed(e.to_string()))?;

        Ok(())
    }

    async fn abort(&self, session: &UploadSession) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(|e| StorageError::abort_failed(e.to_string()))?;

        Ok(())
    }
}
