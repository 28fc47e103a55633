//! Request signing interface shared by all providers.
//!
//! Each provider authenticates requests differently (SigV4 for S3, Shared
//! Key for Azure, OAuth bearer tokens for Google). They all implement
//! [`RequestSigner`], turning a [`SigningContext`] into a [`SignedRequest`]
//! that only needs a body attached before it goes to the transport.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use cloudstash_common::{ObjectKey, Provider, Result, StorageError};

use crate::transport::{HttpRequest, RequestBody};

type HmacSha256 = Hmac<Sha256>;

/// Everything except RFC 3986 unreserved characters is percent-encoded.
pub(crate) const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// What the signer knows about the request payload.
#[derive(Debug, Clone)]
pub enum Payload {
    /// No body.
    Empty,
    /// Fully buffered body.
    Bytes(Bytes),
    /// Body streamed after signing.
    Streaming { length: Option<u64> },
}

impl Payload {
    /// Body length, if known at signing time.
    pub fn length(&self) -> Option<u64> {
        match self {
            Payload::Empty => Some(0),
            Payload::Bytes(bytes) => Some(bytes.len() as u64),
            Payload::Streaming { length } => *length,
        }
    }
}

/// Inputs to a single signature. Built fresh for every request.
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub method: Method,
    pub key: ObjectKey,
    /// Extra query parameters, in the order they should appear in the URL.
    pub query: Vec<(String, String)>,
    pub payload: Payload,
    /// Wall-clock time of signing.
    pub timestamp: DateTime<Utc>,
}

impl SigningContext {
    pub fn new(method: Method, key: ObjectKey, payload: Payload) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Override the signing time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Method, URL and authentication headers for one request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl SignedRequest {
    /// Attach a body, producing a request for the transport.
    pub fn into_request(self, body: RequestBody) -> HttpRequest {
        HttpRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body,
        }
    }
}

/// Provider-specific request authentication.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    fn provider(&self) -> Provider;

    /// Produce the URL and headers for a request described by `context`.
    ///
    /// # Errors
    /// - Configuration error for inputs that cannot be encoded
    /// - Authentication error when a credential exchange fails
    async fn sign(&self, context: &SigningContext) -> Result<SignedRequest>;
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Insert a header, rejecting values that are not valid header text.
pub(crate) fn insert_header(
    headers: &mut HeaderMap,
    provider: Provider,
    name: &'static str,
    value: &str,
) -> Result<()> {
    let value = HeaderValue::from_str(value).map_err(|e| {
        StorageError::configuration(provider, format!("Invalid value for header {}: {}", name, e))
    })?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// `/seg/seg` with every segment encoded; `/` for the root.
pub(crate) fn encode_key_path(key: &ObjectKey) -> String {
    let segments: Vec<String> = key
        .components()
        .iter()
        .map(|segment| utf8_percent_encode(segment, URI_ENCODE).to_string())
        .collect();
    format!("/{}", segments.join("/"))
}

pub(crate) fn parse_url(provider: Provider, url: &str) -> Result<Url> {
    Url::parse(url)
        .map_err(|e| StorageError::configuration(provider, format!("Invalid request URL {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_empty_string() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_payload_length() {
        assert_eq!(Payload::Empty.length(), Some(0));
        assert_eq!(Payload::Bytes(Bytes::from_static(b"1234")).length(), Some(4));
        assert_eq!(Payload::Streaming { length: None }.length(), None);
    }

    #[test]
    fn test_encoded_path_survives_url_parsing() {
        for raw in ["a/..b/c.txt", ".hidden/x", "dir/c..txt", "Q1 summary+final.pdf"] {
            let key = ObjectKey::parse(raw).unwrap();
            let path = encode_key_path(&key);
            let url = parse_url(Provider::Aws, &format!("https://b.s3.amazonaws.com{}", path)).unwrap();
            assert_eq!(url.path(), path);
        }
    }

    #[test]
    fn test_insert_header_rejects_newlines() {
        let mut headers = HeaderMap::new();
        let result = insert_header(&mut headers, Provider::Aws, "x-amz-date", "bad\nvalue");
        assert!(result.is_err());
    }
}
