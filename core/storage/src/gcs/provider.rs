//! Google Cloud Storage provider.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::utf8_percent_encode;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info};

use cloudstash_common::{ErrorKind, ObjectKey, Provider, Result, Secret, StorageError};

use super::jwt::JwtSigner;
use super::token::{TokenCache, TokenIssuer};
use crate::config::GoogleConfig;
use crate::provider::{require_object_key, StorageProvider, UploadReceipt};
use crate::signing::{
    insert_header, parse_url, Payload, RequestSigner, SignedRequest, SigningContext, URI_ENCODE,
};
use crate::transfer::{DownloadSink, Downloaded, Operation, TransferCoordinator, UploadSource};
use crate::transport::{HttpTransport, RequestBody};

pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
const API_BASE: &str = "https://storage.googleapis.com";

/// Bearer-token signer for the Cloud Storage JSON API.
///
/// POST requests go to the media upload endpoint; everything else addresses
/// the object resource directly.
pub struct GoogleSigner {
    bucket: String,
    issuer: TokenIssuer,
    cache: Option<Arc<TokenCache>>,
}

impl GoogleSigner {
    /// # Errors
    /// - Configuration error for missing fields or an unparsable private key
    pub fn new(config: &GoogleConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;

        let jwt = JwtSigner::from_pem(
            config.credentials.client_email.clone(),
            config.credentials.private_key.expose(),
        )?;
        let scope = config.scope.as_deref().unwrap_or(DEFAULT_SCOPE);

        Ok(Self {
            bucket: config.bucket_name.clone(),
            issuer: TokenIssuer::new(jwt, scope, transport)?,
            cache: config.cache_tokens.then(TokenCache::global),
        })
    }

    /// Use `cache` instead of the process-wide one.
    pub fn with_token_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// A bearer token, from the cache when enabled.
    pub async fn access_token(&self) -> Result<Secret> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_or_fetch(self.issuer.client_email(), self.issuer.scope(), || {
                        self.issuer.issue()
                    })
                    .await
            }
            None => Ok(self.issuer.issue().await?.token),
        }
    }

    fn object_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            API_BASE,
            self.bucket,
            utf8_percent_encode(&key.as_key(), URI_ENCODE)
        )
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/storage/v1/b/{}/o", API_BASE, self.bucket)
    }
}

#[async_trait]
impl RequestSigner for GoogleSigner {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn sign(&self, context: &SigningContext) -> Result<SignedRequest> {
        let mut url = if context.method == Method::POST {
            let mut url = parse_url(Provider::Google, &self.upload_url())?;
            url.query_pairs_mut()
                .append_pair("uploadType", "media")
                .append_pair("name", &context.key.as_key());
            url
        } else {
            parse_url(Provider::Google, &self.object_url(&context.key))?
        };
        if !context.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &context.query {
                pairs.append_pair(name, value);
            }
        }

        let token = self.access_token().await?;
        let mut headers = HeaderMap::new();
        insert_header(
            &mut headers,
            Provider::Google,
            "authorization",
            &format!("Bearer {}", token.expose()),
        )?;

        debug!(method = %context.method, key = %context.key, "Signed Cloud Storage request");
        Ok(SignedRequest {
            method: context.method.clone(),
            url,
            headers,
        })
    }
}

/// Objects in one Cloud Storage bucket.
pub struct GoogleProvider {
    bucket: String,
    signer: GoogleSigner,
    transport: Arc<dyn HttpTransport>,
    coordinator: TransferCoordinator,
}

impl GoogleProvider {
    pub fn new(config: &GoogleConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let signer = GoogleSigner::new(config, transport.clone())?;
        Ok(Self::with_signer(config.bucket_name.clone(), signer, transport))
    }

    pub fn with_signer(
        bucket: impl Into<String>,
        signer: GoogleSigner,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            signer,
            transport,
            coordinator: TransferCoordinator::new(Provider::Google),
        }
    }
}

#[async_trait]
impl StorageProvider for GoogleProvider {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn name(&self) -> String {
        format!("google:{}", self.bucket)
    }

    async fn upload(&self, source: UploadSource, key: &ObjectKey) -> Result<UploadReceipt> {
        require_object_key(Provider::Google, key)?;
        info!(bucket = %self.bucket, key = %key, "Uploading to Cloud Storage");

        // Bearer auth does not cover the body, so files stream straight through.
        let (body, payload) = self.coordinator.stream_source(source).await?;
        let context = SigningContext::new(Method::POST, key.clone(), payload);
        let mut request = self.signer.sign(&context).await?.into_request(body);
        request.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Upload)
            .await?;

        let status = response.status;
        let body = response.bytes().await.map_err(|e| {
            StorageError::from_status(
                Provider::Google,
                ErrorKind::Network,
                "Failed to read upload response",
                status,
                Bytes::new(),
            )
            .with_source(e)
        })?;
        let document: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            StorageError::from_status(
                Provider::Google,
                ErrorKind::Network,
                "Failed to parse upload response",
                status,
                body.clone(),
            )
            .with_source(e)
        })?;

        Ok(UploadReceipt {
            provider: Provider::Google,
            key: key.as_key(),
            size: document["size"].as_str().and_then(|s| s.parse().ok()),
            etag: document["etag"].as_str().map(str::to_string),
            response: Some(document),
        })
    }

    async fn download(&self, key: &ObjectKey, sink: DownloadSink) -> Result<Downloaded> {
        require_object_key(Provider::Google, key)?;
        info!(bucket = %self.bucket, key = %key, ?sink, "Downloading from Cloud Storage");

        let context = SigningContext::new(Method::GET, key.clone(), Payload::Empty)
            .with_query("alt", "media");
        let request = self
            .signer
            .sign(&context)
            .await?
            .into_request(RequestBody::Empty);
        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Download)
            .await?;

        self.coordinator.deliver(response, sink).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        require_object_key(Provider::Google, key)?;
        info!(bucket = %self.bucket, key = %key, "Deleting from Cloud Storage");

        let context = SigningContext::new(Method::DELETE, key.clone(), Payload::Empty);
        let request = self
            .signer
            .sign(&context)
            .await?
            .into_request(RequestBody::Empty);
        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::Delete)
            .await?;

        if response.status != 204 {
            debug!(status = response.status, "Unexpected delete status");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GoogleCredentials;
    use crate::transport::MemoryTransport;
    use tempfile::TempDir;

    const PEM: &str = include_str!("../../testdata/service_account_key.pem");

    fn config(cache_tokens: bool) -> GoogleConfig {
        GoogleConfig {
            bucket_name: "media".to_string(),
            credentials: GoogleCredentials {
                client_email: "uploader@project.iam.gserviceaccount.com".to_string(),
                private_key: Secret::new(PEM),
            },
            scope: None,
            cache_tokens,
        }
    }

    fn setup() -> (Arc<MemoryTransport>, GoogleProvider) {
        let transport = Arc::new(MemoryTransport::new());
        let provider = GoogleProvider::new(&config(false), transport.clone()).unwrap();
        (transport, provider)
    }

    fn key(path: &str) -> ObjectKey {
        ObjectKey::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (transport, provider) = setup();

        let receipt = provider
            .upload(UploadSource::bytes("gcs payload"), &key("photos/2024/cat.jpg"))
            .await
            .unwrap();
        assert_eq!(receipt.size, Some(11));
        assert_eq!(receipt.response.as_ref().unwrap()["name"], "photos/2024/cat.jpg");
        assert_eq!(
            transport.object_ids(),
            vec!["storage.googleapis.com/media/photos/2024/cat.jpg"]
        );

        let upload = transport.last_request().unwrap();
        assert_eq!(upload.method, Method::POST);
        assert_eq!(upload.url.path(), "/upload/storage/v1/b/media/o");
        assert!(upload
            .url
            .query_pairs()
            .any(|(k, v)| k == "uploadType" && v == "media"));
        assert_eq!(upload.headers["authorization"], "Bearer memory-token-1");
        assert_eq!(upload.headers["content-type"], "application/octet-stream");

        let downloaded = provider
            .download(&key("photos/2024/cat.jpg"), DownloadSink::Buffer)
            .await
            .unwrap();
        assert_eq!(downloaded.into_bytes().unwrap(), Bytes::from_static(b"gcs payload"));

        let download = transport.last_request().unwrap();
        assert_eq!(download.url.path(), "/storage/v1/b/media/o/photos%2F2024%2Fcat.jpg");
        assert_eq!(download.url.query(), Some("alt=media"));
    }

    #[tokio::test]
    async fn test_upload_streams_file() {
        let (transport, provider) = setup();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.bin");
        std::fs::write(&path, vec![3u8; 2048]).unwrap();

        let receipt = provider
            .upload(UploadSource::path(&path), &key("video.bin"))
            .await
            .unwrap();
        assert_eq!(receipt.size, Some(2048));
        assert_eq!(transport.last_request().unwrap().body.len(), 2048);
    }

    #[tokio::test]
    async fn test_every_operation_exchanges_a_token() {
        let (transport, provider) = setup();
        provider
            .upload(UploadSource::bytes("a"), &key("a.txt"))
            .await
            .unwrap();
        provider
            .download(&key("a.txt"), DownloadSink::Buffer)
            .await
            .unwrap();
        provider.delete(&key("a.txt")).await.unwrap();

        assert_eq!(transport.token_exchanges(), 3);
        assert!(transport.object_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cached_tokens_are_reused() {
        let transport = Arc::new(MemoryTransport::new());
        let signer = GoogleSigner::new(&config(true), transport.clone())
            .unwrap()
            .with_token_cache(Arc::new(TokenCache::new()));
        let provider = GoogleProvider::with_signer("media", signer, transport.clone());

        provider
            .upload(UploadSource::bytes("a"), &key("a.txt"))
            .await
            .unwrap();
        provider
            .download(&key("a.txt"), DownloadSink::Buffer)
            .await
            .unwrap();

        assert_eq!(transport.token_exchanges(), 1);
    }

    #[tokio::test]
    async fn test_token_failure_stops_operation() {
        let (transport, provider) = setup();
        transport.fail_next(401, r#"{"error":"unauthorized_client"}"#);

        let err = provider
            .download(&key("a.txt"), DownloadSink::Buffer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.provider(), Provider::Google);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_download_to_file_fails() {
        let (transport, provider) = setup();
        let dir = TempDir::new().unwrap();
        provider
            .upload(UploadSource::bytes(vec![5u8; 50]), &key("f.bin"))
            .await
            .unwrap();
        transport.truncate_downloads_after(20);

        let destination = dir.path().join("f.bin");
        let err = provider
            .download(&key("f.bin"), DownloadSink::File(destination.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_object() {
        let (_transport, provider) = setup();
        let err = provider.delete(&key("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileDeletion);
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_list_is_unsupported() {
        let (transport, provider) = setup();
        let err = provider.list(&key("photos")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(transport.token_exchanges(), 0);
    }

    #[test]
    fn test_unparsable_key_is_configuration_error() {
        let mut broken = config(false);
        broken.credentials.private_key = Secret::new("not a pem");
        let err = GoogleProvider::new(&broken, Arc::new(MemoryTransport::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
