//! Storage provider trait definition.

use async_trait::async_trait;
use serde::Serialize;

use cloudstash_common::{ObjectKey, Provider, Result, StorageError};

use crate::transfer::{DownloadSink, Downloaded, UploadSource};

/// Outcome of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub provider: Provider,
    /// Remote key the object was written to.
    pub key: String,
    /// Uploaded size in bytes, when known.
    pub size: Option<u64>,
    /// ETag or generation reported by the service.
    pub etag: Option<String>,
    /// Provider response document, for backends that return one.
    pub response: Option<serde_json::Value>,
}

/// Storage provider trait for different backends.
///
/// Every operation is a single authenticated request against the remote
/// service. Nothing is retried; failures surface as [`StorageError`] with
/// the provider, kind, status and raw body attached.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend identity.
    fn provider(&self) -> Provider;

    /// Human readable name, e.g. `aws:my-bucket`.
    fn name(&self) -> String;

    /// Upload `source` to `key`, replacing any existing object.
    ///
    /// # Preconditions
    /// - `key` is not the root
    ///
    /// # Errors
    /// - Configuration error if the local source cannot be read
    /// - Authentication error on credential rejection
    /// - Network error on transport failure or any other error status
    async fn upload(&self, source: UploadSource, key: &ObjectKey) -> Result<UploadReceipt>;

    /// Download `key` into the requested sink.
    ///
    /// A file sink is only reported as written once every byte is on disk;
    /// a failure part way leaves no file behind.
    ///
    /// # Errors
    /// - Network error if the object is missing, the transfer fails, or the
    ///   file cannot be written
    /// - Authentication error on credential rejection
    async fn download(&self, key: &ObjectKey, sink: DownloadSink) -> Result<Downloaded>;

    /// Delete `key`.
    ///
    /// # Errors
    /// - FileDeletion error for error statuses other than 401/403
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Keys under `prefix`, in the order the service returned them.
    ///
    /// Only the first page of results is returned.
    ///
    /// # Errors
    /// - Unsupported for backends without listing
    async fn list(&self, prefix: &ObjectKey) -> Result<Vec<String>> {
        let _ = prefix;
        Err(StorageError::unsupported(self.provider(), "list"))
    }
}

/// Reject the root key for single-object operations.
pub(crate) fn require_object_key(provider: Provider, key: &ObjectKey) -> Result<()> {
    if key.is_root() {
        return Err(StorageError::configuration(
            provider,
            "Object key must not be empty",
        ));
    }
    Ok(())
}
