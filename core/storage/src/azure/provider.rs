//! Azure Blob Storage provider.

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use tracing::info;

use cloudstash_common::{ObjectKey, Provider, Result};

use super::signer::AzureSigner;
use crate::config::AzureConfig;
use crate::provider::{require_object_key, StorageProvider, UploadReceipt};
use crate::signing::{Payload, RequestSigner, SigningContext};
use crate::transfer::{DownloadSink, Downloaded, Operation, TransferCoordinator, UploadSource};
use crate::transport::{HttpTransport, HttpResponse, RequestBody};

/// Block blobs in a single container.
pub struct AzureProvider {
    container: String,
    signer: AzureSigner,
    transport: Arc<dyn HttpTransport>,
    coordinator: TransferCoordinator,
}

impl AzureProvider {
    /// # Errors
    /// - Configuration error for missing fields or an undecodable account key
    pub fn new(config: &AzureConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        Ok(Self {
            container: config.container_name.clone(),
            signer: AzureSigner::new(config)?,
            transport,
            coordinator: TransferCoordinator::new(Provider::Azure),
        })
    }

    async fn send(
        &self,
        method: Method,
        key: &ObjectKey,
        payload: Payload,
        body: RequestBody,
        operation: Operation,
    ) -> Result<HttpResponse> {
        let context = SigningContext::new(method, key.clone(), payload);
        let request = self.signer.sign(&context).await?.into_request(body);
        self.coordinator
            .dispatch(self.transport.as_ref(), request, operation)
            .await
    }
}

#[async_trait]
impl StorageProvider for AzureProvider {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn name(&self) -> String {
        format!("azure:{}/{}", self.signer.account(), self.container)
    }

    async fn upload(&self, source: UploadSource, key: &ObjectKey) -> Result<UploadReceipt> {
        require_object_key(Provider::Azure, key)?;
        info!(container = %self.container, key = %key, "Uploading to Azure");

        // Shared Key signs the exact Content-Length.
        let data = self.coordinator.buffer_source(source).await?;
        let size = data.len() as u64;

        let response = self
            .send(
                Method::PUT,
                key,
                Payload::Bytes(data.clone()),
                RequestBody::Bytes(data),
                Operation::Upload,
            )
            .await?;

        Ok(UploadReceipt {
            provider: Provider::Azure,
            key: key.as_key(),
            size: Some(size),
            etag: response.header("etag").map(str::to_string),
            response: None,
        })
    }

    async fn download(&self, key: &ObjectKey, sink: DownloadSink) -> Result<Downloaded> {
        require_object_key(Provider::Azure, key)?;
        info!(container = %self.container, key = %key, ?sink, "Downloading from Azure");

        let response = self
            .send(Method::GET, key, Payload::Empty, RequestBody::Empty, Operation::Download)
            .await?;
        self.coordinator.deliver(response, sink).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        require_object_key(Provider::Azure, key)?;
        info!(container = %self.container, key = %key, "Deleting from Azure");

        self.send(Method::DELETE, key, Payload::Empty, RequestBody::Empty, Operation::Delete)
            .await?;
        Ok(())
    }
}
