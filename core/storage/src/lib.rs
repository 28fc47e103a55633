//! Object storage access for CloudStash.
//!
//! One [`StorageProvider`] contract over three backends (AWS S3, Google
//! Cloud Storage and Azure Blob Storage), each with its own request
//! authentication scheme.
//!
//! # Design Principles
//! - Provider isolation: signing logic lives behind [`RequestSigner`]
//! - Async operations: all I/O goes through an [`HttpTransport`]
//! - Streaming support: uploads and downloads accept paths, buffers or streams
//! - Unified error semantics: every failure is a `StorageError`

pub mod aws;
pub mod azure;
pub mod config;
pub mod factory;
pub mod gcs;
pub mod provider;
pub mod signing;
pub mod transfer;
pub mod transport;

pub use aws::{AwsProvider, AwsSigner};
pub use azure::{AzureProvider, AzureSigner};
pub use config::{AwsConfig, AzureConfig, ConfigError, GoogleConfig, ProviderConfig};
pub use factory::{create_provider, create_provider_with_transport};
pub use gcs::{GoogleProvider, GoogleSigner, TokenCache};
pub use provider::{StorageProvider, UploadReceipt};
pub use signing::{Payload, RequestSigner, SignedRequest, SigningContext};
pub use transfer::{DownloadSink, Downloaded, TransferCoordinator, UploadSource};
pub use transport::{ByteStream, HttpTransport, MemoryTransport, ReqwestTransport};

pub use cloudstash_common::{ErrorKind, ObjectKey, Provider, Result, StorageError};
