//! Azure Blob Storage backend using Shared Key authentication.

mod provider;
pub mod signer;

pub use provider::AzureProvider;
pub use signer::AzureSigner;
