//! RS256 service account assertions.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::Sha256;

use cloudstash_common::{Provider, Result, StorageError};

/// Lifetime of an assertion, and of the token Google issues for it.
pub const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

/// Signs JWT assertions as a service account.
pub struct JwtSigner {
    client_email: String,
    key: SigningKey<Sha256>,
}

impl JwtSigner {
    /// Parse a PEM private key, PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
    /// (`BEGIN RSA PRIVATE KEY`).
    ///
    /// # Errors
    /// - Configuration error if the key cannot be parsed
    pub fn from_pem(client_email: impl Into<String>, pem: &str) -> Result<Self> {
        // Key files embedded in JSON sometimes keep literal `\n` escapes.
        let pem = pem.trim().replace("\\n", "\n");

        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| {
                StorageError::configuration(Provider::Google, "Failed to parse service account private key")
                    .with_source(e)
            })?;

        Ok(Self {
            client_email: client_email.into(),
            key: SigningKey::<Sha256>::new(key),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// Build a signed `header.claims.signature` assertion valid for one hour
    /// from `issued_at`.
    pub fn assertion(&self, scope: &str, audience: &str, issued_at: DateTime<Utc>) -> Result<String> {
        let iat = issued_at.timestamp();
        let header = Header {
            alg: "RS256",
            typ: "JWT",
        };
        let claims = Claims {
            iss: &self.client_email,
            scope,
            aud: audience,
            exp: iat + ASSERTION_LIFETIME_SECS,
            iat,
        };

        let signing_input = format!("{}.{}", encode_json(&header)?, encode_json(&claims)?);
        let signature = self.key.sign(signing_input.as_bytes());

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).map_err(|e| {
        StorageError::configuration(Provider::Google, "Failed to encode JWT").with_source(e)
    })?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}
