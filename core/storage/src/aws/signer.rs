//! AWS Signature Version 4 for S3.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::utf8_percent_encode;
use reqwest::header::HeaderMap;
use reqwest::Method;
use url::Url;

use cloudstash_common::{ObjectKey, Provider, Result, Secret, StorageError};

use crate::config::AwsConfig;
use crate::signing::{
    encode_key_path, hmac_sha256, insert_header, parse_url, sha256_hex, Payload, RequestSigner,
    SignedRequest, SigningContext, URI_ENCODE,
};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// SHA-256 of the empty string.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// Longest validity S3 accepts for a presigned URL (7 days).
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 604_800;

const SERVICE: &str = "s3";
const TERMINATOR: &str = "aws4_request";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// SigV4 signer bound to one bucket.
#[derive(Debug, Clone)]
pub struct AwsSigner {
    access_key_id: String,
    secret_access_key: Secret,
    region: String,
    scheme: String,
    host: String,
}

impl AwsSigner {
    /// Create a signer for the configured bucket.
    ///
    /// # Errors
    /// - Missing configuration fields
    /// - Unparsable custom endpoint
    pub fn new(config: &AwsConfig) -> Result<Self> {
        config.validate()?;

        let (scheme, host) = match &config.endpoint {
            Some(endpoint) => {
                let url = parse_url(Provider::Aws, endpoint)?;
                let base = url.host_str().ok_or_else(|| {
                    StorageError::configuration(Provider::Aws, format!("Endpoint has no host: {}", endpoint))
                })?;
                let host = match url.port() {
                    Some(port) => format!("{}.{}:{}", config.bucket_name, base, port),
                    None => format!("{}.{}", config.bucket_name, base),
                };
                (url.scheme().to_string(), host)
            }
            None if config.regional_host => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", config.bucket_name, config.region),
            ),
            None => (
                "https".to_string(),
                format!("{}.s3.amazonaws.com", config.bucket_name),
            ),
        };

        Ok(Self {
            access_key_id: config.credentials.access_key_id.clone(),
            secret_access_key: config.credentials.secret_access_key.clone(),
            region: config.region.clone(),
            scheme,
            host,
        })
    }

    /// Host header value, e.g. `bucket.s3.amazonaws.com`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `date/region/s3/aws4_request`.
    pub fn credential_scope(&self, date: &str) -> String {
        format!("{}/{}/{}/{}", date, self.region, SERVICE, TERMINATOR)
    }

    /// Sign with `Authorization`, `x-amz-date`, `x-amz-content-sha256`
    /// and `host` headers.
    pub fn sign_headers(&self, context: &SigningContext) -> Result<SignedRequest> {
        let amz_date = format_amz_date(&context.timestamp);
        let date = &amz_date[..8];
        let scope = self.credential_scope(date);

        let uri = canonical_uri(&context.key);
        let query = canonical_query(&context.query);
        let payload_hash = payload_hash(&context.payload);

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host, payload_hash, amz_date
        );
        let canonical_request = canonical_request(
            context.method.as_str(),
            &uri,
            &query,
            &canonical_headers,
            SIGNED_HEADERS,
            &payload_hash,
        );
        let signature = self.signature(date, &amz_date, &scope, &canonical_request);

        tracing::debug!(
            method = %context.method,
            key = %context.key,
            amz_date = %amz_date,
            "Signed S3 request"
        );

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key_id, scope, SIGNED_HEADERS, signature
        );

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, Provider::Aws, "authorization", &authorization)?;
        insert_header(&mut headers, Provider::Aws, "x-amz-date", &amz_date)?;
        insert_header(&mut headers, Provider::Aws, "x-amz-content-sha256", &payload_hash)?;
        insert_header(&mut headers, Provider::Aws, "host", &self.host)?;

        Ok(SignedRequest {
            method: context.method.clone(),
            url: self.url(&uri, &query)?,
            headers,
        })
    }

    /// Build a query-signed URL usable without extra headers.
    ///
    /// # Errors
    /// - Configuration error if `expires_secs` is 0 or exceeds 7 days
    pub fn presign(
        &self,
        method: &Method,
        key: &ObjectKey,
        expires_secs: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<Url> {
        if expires_secs == 0 || expires_secs > MAX_PRESIGN_EXPIRY_SECS {
            return Err(StorageError::configuration(
                Provider::Aws,
                format!(
                    "Presigned URL expiry must be between 1 and {} seconds",
                    MAX_PRESIGN_EXPIRY_SECS
                ),
            ));
        }

        let amz_date = format_amz_date(&timestamp);
        let date = &amz_date[..8];
        let scope = self.credential_scope(date);

        let params = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.access_key_id, scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];

        let uri = canonical_uri(key);
        let query = canonical_query(&params);
        let canonical_headers = format!("host:{}\n", self.host);
        let canonical_request = canonical_request(
            method.as_str(),
            &uri,
            &query,
            &canonical_headers,
            "host",
            UNSIGNED_PAYLOAD,
        );
        let signature = self.signature(date, &amz_date, &scope, &canonical_request);

        self.url(&uri, &format!("{}&X-Amz-Signature={}", query, signature))
    }

    /// Presigned GET URL valid from now.
    pub fn presign_get(&self, key: &ObjectKey, expires_secs: u64) -> Result<Url> {
        self.presign(&Method::GET, key, expires_secs, Utc::now())
    }

    fn signature(&self, date: &str, amz_date: &str, scope: &str, canonical_request: &str) -> String {
        let string_to_sign = string_to_sign(amz_date, scope, canonical_request);
        let signing_key = derive_signing_key(
            self.secret_access_key.expose(),
            date,
            &self.region,
            SERVICE,
        );
        hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    fn url(&self, uri: &str, query: &str) -> Result<Url> {
        let url = if query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, uri)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.host, uri, query)
        };
        parse_url(Provider::Aws, &url)
    }
}

#[async_trait]
impl RequestSigner for AwsSigner {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn sign(&self, context: &SigningContext) -> Result<SignedRequest> {
        self.sign_headers(context)
    }
}

/// `YYYYMMDDTHHMMSSZ`.
pub fn format_amz_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Hex SHA-256 of the body, or `UNSIGNED-PAYLOAD` for streamed bodies.
pub fn payload_hash(payload: &Payload) -> String {
    match payload {
        Payload::Empty => EMPTY_PAYLOAD_SHA256.to_string(),
        Payload::Bytes(bytes) => sha256_hex(bytes),
        Payload::Streaming { .. } => UNSIGNED_PAYLOAD.to_string(),
    }
}

/// Each key segment URI-encoded, separators kept.
pub fn canonical_uri(key: &ObjectKey) -> String {
    encode_key_path(key)
}

/// Parameters sorted by name then value, both URI-encoded.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| {
            (
                utf8_percent_encode(k, URI_ENCODE).to_string(),
                utf8_percent_encode(v, URI_ENCODE).to_string(),
            )
        })
        .collect();
    encoded.sort();

    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// `canonical_headers` must already end with a newline; the extra newline
/// here produces the blank line before the signed header list.
pub fn canonical_request(
    method: &str,
    uri: &str,
    query: &str,
    canonical_headers: &str,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, uri, query, canonical_headers, signed_headers, payload_hash
    )
}

pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    )
}

/// HMAC chain over date, region, service and the `aws4_request` terminator.
pub fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}
