//! Google Cloud Storage backend authenticated with service account tokens.

pub mod jwt;
mod provider;
pub mod token;

pub use jwt::JwtSigner;
pub use provider::{GoogleProvider, GoogleSigner, DEFAULT_SCOPE};
pub use token::{AccessToken, TokenCache, TokenIssuer};
