//! Provider construction from configuration.

use std::sync::Arc;
use tracing::debug;

use cloudstash_common::{Provider, Result, StorageError};

use crate::aws::AwsProvider;
use crate::azure::AzureProvider;
use crate::config::ProviderConfig;
use crate::gcs::GoogleProvider;
use crate::provider::StorageProvider;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Create the configured provider over a default HTTP client.
///
/// # Errors
/// - Configuration error if the block for the selected provider is missing
///   or invalid, or the HTTP client cannot be built
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
    // Validate before building a client so bad config never touches the network stack.
    require_block(config)?;

    let transport = ReqwestTransport::new().map_err(|e| {
        StorageError::configuration(config.provider, "Failed to build HTTP client").with_source(e)
    })?;
    create_provider_with_transport(config, Arc::new(transport))
}

/// Create the configured provider over `transport`.
///
/// # Errors
/// - Configuration error if the block for the selected provider is missing
///   or invalid
pub fn create_provider_with_transport(
    config: &ProviderConfig,
    transport: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn StorageProvider>> {
    require_block(config)?;
    debug!(provider = %config.provider, "Creating storage provider");

    match config.provider {
        Provider::Aws => {
            let aws = config.aws.as_ref().ok_or_else(|| missing(Provider::Aws))?;
            Ok(Arc::new(AwsProvider::new(aws, transport)?))
        }
        Provider::Google => {
            let google = config.google.as_ref().ok_or_else(|| missing(Provider::Google))?;
            Ok(Arc::new(GoogleProvider::new(google, transport)?))
        }
        Provider::Azure => {
            let azure = config.azure.as_ref().ok_or_else(|| missing(Provider::Azure))?;
            Ok(Arc::new(AzureProvider::new(azure, transport)?))
        }
    }
}

fn require_block(config: &ProviderConfig) -> Result<()> {
    let present = match config.provider {
        Provider::Aws => config.aws.is_some(),
        Provider::Google => config.google.is_some(),
        Provider::Azure => config.azure.is_some(),
    };
    if present {
        Ok(())
    } else {
        Err(missing(config.provider))
    }
}

fn missing(provider: Provider) -> StorageError {
    let name = match provider {
        Provider::Aws => "AWS",
        Provider::Google => "Google Cloud Storage",
        Provider::Azure => "Azure Blob Storage",
    };
    StorageError::configuration(provider, format!("{} configuration is required", name))
}
