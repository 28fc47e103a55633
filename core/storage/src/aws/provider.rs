//! AWS S3 storage provider.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use cloudstash_common::{ErrorKind, ObjectKey, Provider, Result, StorageError};

use super::signer::AwsSigner;
use crate::config::AwsConfig;
use crate::provider::{require_object_key, StorageProvider, UploadReceipt};
use crate::signing::{Payload, RequestSigner, SigningContext};
use crate::transfer::{DownloadSink, Downloaded, Operation, TransferCoordinator, UploadSource};
use crate::transport::{HttpTransport, RequestBody};

const OCTET_STREAM: &str = "application/octet-stream";

/// `ListObjectsV2` response, reduced to the fields we read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

/// S3 bucket accessed with SigV4 header signing.
pub struct AwsProvider {
    bucket: String,
    signer: AwsSigner,
    transport: Arc<dyn HttpTransport>,
    coordinator: TransferCoordinator,
}

impl AwsProvider {
    /// Create a provider for the configured bucket.
    ///
    /// # Errors
    /// - Configuration error for missing fields or an invalid endpoint
    pub fn new(config: &AwsConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let signer = AwsSigner::new(config)?;
        Ok(Self {
            bucket: config.bucket_name.clone(),
            signer,
            transport,
            coordinator: TransferCoordinator::new(Provider::Aws),
        })
    }

    pub fn signer(&self) -> &AwsSigner {
        &self.signer
    }

    /// Query-signed GET URL for `key`, valid for `expires_secs`.
    pub fn presigned_url(&self, key: &ObjectKey, expires_secs: u64) -> Result<Url> {
        require_object_key(Provider::Aws, key)?;
        self.signer.presign_get(key, expires_secs)
    }
}

#[async_trait]
impl StorageProvider for AwsProvider {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn name(&self) -> String {
        format!("aws:{}", self.bucket)
    }

    async fn upload(&self, source: UploadSource, key: &ObjectKey) -> Result<UploadReceipt> {
        require_object_key(Provider::Aws, key)?;
        info!(bucket = %self.bucket, key = %key, "Uploading to S3");

        // SigV4 needs the payload hash before the request is sent.
        let data = self.coordinator.buffer_source(source).await?;
        let size = data.len() as u64;

        let context = SigningContext::new(Method::PUT, key.clone(), Payload::Bytes(data.clone()));
        let signed = self.signer.sign(&context).await?;
        let mut request = signed.into_request(RequestBody::Bytes(data));
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));

        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Upload)
            .await?;
        let etag = response.header("etag").map(str::to_string);

        debug!(key = %key, size, "S3 upload complete");
        Ok(UploadReceipt {
            provider: Provider::Aws,
            key: key.as_key(),
            size: Some(size),
            etag,
            response: None,
        })
    }

    async fn download(&self, key: &ObjectKey, sink: DownloadSink) -> Result<Downloaded> {
        require_object_key(Provider::Aws, key)?;
        info!(bucket = %self.bucket, key = %key, ?sink, "Downloading from S3");

        let context = SigningContext::new(Method::GET, key.clone(), Payload::Empty);
        let request = self.signer.sign(&context).await?.into_request(RequestBody::Empty);
        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Download)
            .await?;

        self.coordinator.deliver(response, sink).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        require_object_key(Provider::Aws, key)?;
        info!(bucket = %self.bucket, key = %key, "Deleting from S3");

        let context = SigningContext::new(Method::DELETE, key.clone(), Payload::Empty);
        let request = self.signer.sign(&context).await?.into_request(RequestBody::Empty);
        self.coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Delete)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &ObjectKey) -> Result<Vec<String>> {
        let prefix = prefix.as_prefix();
        debug!(bucket = %self.bucket, prefix = %prefix, "Listing S3 objects");

        let context = SigningContext::new(Method::GET, ObjectKey::root(), Payload::Empty)
            .with_query("list-type", "2")
            .with_query("prefix", prefix);
        let request = self.signer.sign(&context).await?.into_request(RequestBody::Empty);
        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::List)
            .await?;

        let status = response.status;
        let body = response.bytes().await.map_err(|e| {
            StorageError::from_status(
                Provider::Aws,
                ErrorKind::Network,
                "Failed to read list response",
                status,
                Bytes::new(),
            )
            .with_source(e)
        })?;

        let result = parse_list(&body).map_err(|e| {
            StorageError::from_status(
                Provider::Aws,
                ErrorKind::Network,
                "Failed to parse list response",
                status,
                body.clone(),
            )
            .with_source(e)
        })?;

        if result.is_truncated {
            warn!(bucket = %self.bucket, "List result truncated, only the first page is returned");
        }

        Ok(result.contents.into_iter().map(|entry| entry.key).collect())
    }
}

fn parse_list(body: &[u8]) -> std::result::Result<ListBucketResult, quick_xml::de::DeError> {
    quick_xml::de::from_str(&String::from_utf8_lossy(body))
}
