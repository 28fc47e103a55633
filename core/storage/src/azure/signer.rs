//! Azure Blob Storage Shared Key signing.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use cloudstash_common::{ObjectKey, Provider, Result, StorageError};

use crate::config::AzureConfig;
use crate::signing::{
    encode_key_path, hmac_sha256, insert_header, parse_url, RequestSigner, SignedRequest,
    SigningContext,
};

pub const API_VERSION: &str = "2020-10-02";
pub const BLOB_TYPE: &str = "BlockBlob";
/// Content type signed for, and sent with, non-empty bodies.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Shared Key signer for one container.
pub struct AzureSigner {
    account: String,
    container: String,
    key: Zeroizing<Vec<u8>>,
}

impl AzureSigner {
    /// Create a signer, decoding the account key.
    ///
    /// # Errors
    /// - Configuration error for missing fields or a key that is not base64
    pub fn new(config: &AzureConfig) -> Result<Self> {
        config.validate()?;

        let key = STANDARD
            .decode(config.credentials.account_key.expose().trim())
            .map_err(|e| {
                StorageError::configuration(Provider::Azure, "Account key is not valid base64")
                    .with_source(e)
            })?;

        Ok(Self {
            account: config.credentials.account_name.clone(),
            container: config.container_name.clone(),
            key: Zeroizing::new(key),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// `/{account}/{container}/{blob}`.
    pub fn canonical_resource(&self, key: &ObjectKey) -> String {
        format!("/{}/{}{}", self.account, self.container, encode_key_path(key))
    }

    /// Build the string to sign.
    ///
    /// Content-Length is filled only for PUT with a non-empty body and is
    /// otherwise the empty string, never `0`. Content-Type is filled only for
    /// non-empty bodies.
    pub fn string_to_sign(
        &self,
        method: &Method,
        content_length: u64,
        ms_headers: &BTreeMap<&'static str, String>,
        key: &ObjectKey,
    ) -> String {
        let length = if *method == Method::PUT && content_length > 0 {
            content_length.to_string()
        } else {
            String::new()
        };
        let content_type = if content_length > 0 { CONTENT_TYPE } else { "" };

        let fields = [
            method.as_str(),
            "", // Content-Encoding
            "", // Content-Language
            length.as_str(),
            "", // Content-MD5
            content_type,
            "", // Date
            "", // If-Modified-Since
            "", // If-Match
            "", // If-None-Match
            "", // If-Unmodified-Since
            "", // Range
        ];

        let mut out = fields.join("\n");
        out.push('\n');
        for (name, value) in ms_headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(&self.canonical_resource(key));
        out
    }

    /// Base64 HMAC-SHA256 of `string_to_sign` under the account key.
    pub fn signature(&self, string_to_sign: &str) -> String {
        STANDARD.encode(hmac_sha256(&self.key, string_to_sign.as_bytes()))
    }

    /// Canonicalized `x-ms-*` headers for a request, sorted by name.
    pub fn ms_headers(method: &Method, timestamp: &DateTime<Utc>) -> BTreeMap<&'static str, String> {
        let mut headers = BTreeMap::new();
        if *method == Method::PUT {
            headers.insert("x-ms-blob-type", BLOB_TYPE.to_string());
        }
        headers.insert("x-ms-date", format_rfc1123(timestamp));
        headers.insert("x-ms-version", API_VERSION.to_string());
        headers
    }
}

#[async_trait]
impl RequestSigner for AzureSigner {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn sign(&self, context: &SigningContext) -> Result<SignedRequest> {
        let content_length = context.payload.length().ok_or_else(|| {
            StorageError::configuration(
                Provider::Azure,
                "Shared Key signing needs the content length up front",
            )
        })?;

        let ms_headers = Self::ms_headers(&context.method, &context.timestamp);
        let string_to_sign =
            self.string_to_sign(&context.method, content_length, &ms_headers, &context.key);
        let signature = self.signature(&string_to_sign);

        tracing::debug!(
            method = %context.method,
            key = %context.key,
            content_length,
            "Signed Azure request"
        );

        let mut headers = HeaderMap::new();
        for (name, value) in &ms_headers {
            insert_header(&mut headers, Provider::Azure, *name, value)?;
        }
        if content_length > 0 {
            insert_header(&mut headers, Provider::Azure, "content-type", CONTENT_TYPE)?;
        }
        insert_header(
            &mut headers,
            Provider::Azure,
            "authorization",
            &format!("SharedKey {}:{}", self.account, signature),
        )?;

        let url = format!(
            "https://{}.blob.core.windows.net/{}{}",
            self.account,
            self.container,
            encode_key_path(&context.key)
        );

        Ok(SignedRequest {
            method: context.method.clone(),
            url: parse_url(Provider::Azure, &url)?,
            headers,
        })
    }
}

/// `Mon, 01 Jan 2024 00:00:00 GMT`.
pub fn format_rfc1123(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzureCredentials;
    use crate::signing::Payload;
    use bytes::Bytes;
    use chrono::TimeZone;
    use cloudstash_common::{ErrorKind, Secret};

    fn signer() -> AzureSigner {
        AzureSigner::new(&AzureConfig {
            container_name: "backups".to_string(),
            credentials: AzureCredentials {
                account_name: "acct".to_string(),
                // base64("azure-test-key-0123456789")
                account_key: Secret::new("YXp1cmUtdGVzdC1rZXktMDEyMzQ1Njc4OQ=="),
            },
        })
        .unwrap()
    }

    fn new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn key() -> ObjectKey {
        ObjectKey::parse("reports/q1.csv").unwrap()
    }

    #[test]
    fn test_string_to_sign_for_put() {
        let signer = signer();
        let headers = AzureSigner::ms_headers(&Method::PUT, &new_year());
        let sts = signer.string_to_sign(&Method::PUT, 10, &headers, &key());

        assert_eq!(
            sts,
            "PUT\n\n\n10\n\napplication/octet-stream\n\n\n\n\n\n\n\
             x-ms-blob-type:BlockBlob\n\
             x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
             x-ms-version:2020-10-02\n\
             /acct/backups/reports/q1.csv"
        );
        assert_eq!(sts.split('\n').nth(3), Some("10"));
        assert_eq!(
            signer.signature(&sts),
            "V5SlaAb1dSyGD99FzMydPYUGO1tCx7YdOXUo5hOk/Go="
        );
    }

    #[test]
    fn test_content_length_empty_for_delete() {
        let signer = signer();
        let headers = AzureSigner::ms_headers(&Method::DELETE, &new_year());
        let sts = signer.string_to_sign(&Method::DELETE, 10, &headers, &key());

        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[0], "DELETE");
        assert_eq!(lines[3], "");
        assert!(!headers.contains_key("x-ms-blob-type"));
    }

    #[test]
    fn test_every_field_affects_signature() {
        let signer = signer();
        let headers = AzureSigner::ms_headers(&Method::DELETE, &new_year());
        let sts = signer.string_to_sign(&Method::DELETE, 0, &headers, &key());
        let base = signer.signature(&sts);

        let mut lines: Vec<String> = sts.split('\n').map(str::to_string).collect();
        for i in 0..lines.len() {
            let original = lines[i].clone();
            lines[i] = if original.is_empty() {
                "0".to_string()
            } else {
                format!("{}x", original)
            };
            assert_ne!(signer.signature(&lines.join("\n")), base, "line {} ignored", i);
            lines[i] = original;
        }
    }

    #[test]
    fn test_empty_put_has_no_length_or_type() {
        let signer = signer();
        let headers = AzureSigner::ms_headers(&Method::PUT, &new_year());
        let sts = signer.string_to_sign(&Method::PUT, 0, &headers, &key());
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[3], "");
        assert_eq!(lines[5], "");
    }

    #[test]
    fn test_invalid_account_key() {
        let result = AzureSigner::new(&AzureConfig {
            container_name: "backups".to_string(),
            credentials: AzureCredentials {
                account_name: "acct".to_string(),
                account_key: Secret::new("not base64!"),
            },
        });
        let err = result.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.provider(), Provider::Azure);
    }

    #[tokio::test]
    async fn test_signed_request_headers() {
        let signer = signer();
        let context = SigningContext::new(
            Method::PUT,
            key(),
            Payload::Bytes(Bytes::from_static(b"0123456789")),
        )
        .at(new_year());

        let signed = signer.sign(&context).await.unwrap();
        assert_eq!(
            signed.url.as_str(),
            "https://acct.blob.core.windows.net/backups/reports/q1.csv"
        );
        assert_eq!(signed.headers["x-ms-version"], API_VERSION);
        assert_eq!(signed.headers["x-ms-blob-type"], BLOB_TYPE);
        assert_eq!(signed.headers["x-ms-date"], "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(signed.headers["content-type"], CONTENT_TYPE);
        assert_eq!(
            signed.headers["authorization"],
            "SharedKey acct:V5SlaAb1dSyGD99FzMydPYUGO1tCx7YdOXUo5hOk/Go="
        );
    }

    #[tokio::test]
    async fn test_unknown_length_rejected() {
        let context = SigningContext::new(Method::PUT, key(), Payload::Streaming { length: None });
        let err = signer().sign(&context).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
