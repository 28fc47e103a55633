//! AWS S3 backend: SigV4 signing, presigned URLs and the bucket provider.

pub(crate) mod errors;
mod provider;
pub mod signer;

pub use provider::AwsProvider;
pub use signer::AwsSigner;
