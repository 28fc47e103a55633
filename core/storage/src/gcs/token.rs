//! OAuth token exchange for service accounts, with an optional shared cache.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info};
use url::Url;

use cloudstash_common::{ErrorKind, Provider, Result, Secret, StorageError};

use super::jwt::{JwtSigner, ASSERTION_LIFETIME_SECS};
use crate::signing::parse_url;
use crate::transfer::{Operation, TransferCoordinator};
use crate::transport::{HttpRequest, HttpTransport, RequestBody};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Bearer token with expiration tracking.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: Secret,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Check if the token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now() + Duration::minutes(EXPIRY_SKEW_MINUTES)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// Exchanges self-signed assertions for bearer tokens.
pub struct TokenIssuer {
    jwt: JwtSigner,
    scope: String,
    token_url: Url,
    transport: Arc<dyn HttpTransport>,
    coordinator: TransferCoordinator,
}

impl TokenIssuer {
    pub fn new(jwt: JwtSigner, scope: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        Ok(Self {
            jwt,
            scope: scope.into(),
            token_url: parse_url(Provider::Google, TOKEN_URL)?,
            transport,
            coordinator: TransferCoordinator::new(Provider::Google),
        })
    }

    pub fn client_email(&self) -> &str {
        self.jwt.client_email()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Sign a fresh assertion and exchange it for an access token.
    ///
    /// # Errors
    /// - Authentication error for an error status or a response without
    ///   `access_token`
    /// - Network error if no response was received
    pub async fn issue(&self) -> Result<AccessToken> {
        let now = Utc::now();
        let assertion = self.jwt.assertion(&self.scope, TOKEN_URL, now)?;

        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", JWT_BEARER_GRANT)
            .append_pair("assertion", &assertion)
            .finish();

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let request = HttpRequest {
            method: Method::POST,
            url: self.token_url.clone(),
            headers,
            body: RequestBody::Bytes(Bytes::from(form)),
        };

        debug!(client_email = %self.jwt.client_email(), "Exchanging service account assertion");
        let response = self
            .coordinator
            .dispatch(self.transport.as_ref(), request, Operation::TokenExchange)
            .await?;

        let status = response.status;
        let body = response.bytes().await.map_err(|e| {
            StorageError::from_status(
                Provider::Google,
                ErrorKind::Authentication,
                "Failed to read token response",
                status,
                Bytes::new(),
            )
            .with_source(e)
        })?;

        let missing_token = |body: Bytes| {
            StorageError::from_status(
                Provider::Google,
                ErrorKind::Authentication,
                "Token response did not contain an access token",
                status,
                body,
            )
        };

        let parsed: TokenResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => return Err(missing_token(body).with_source(e)),
        };
        let token = match parsed.access_token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(missing_token(body)),
        };

        let lifetime = parsed.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        Ok(AccessToken {
            token: Secret::new(token),
            expires_at: now + Duration::seconds(lifetime),
        })
    }
}

type CacheKey = (String, String);
type Slot = Arc<tokio::sync::Mutex<Option<AccessToken>>>;

/// Access tokens keyed by `(client_email, scope)`.
///
/// Each key has its own async lock held across the exchange, so concurrent
/// callers for one service account wait on a single request instead of
/// issuing their own.
#[derive(Default)]
pub struct TokenCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache.
    pub fn global() -> Arc<TokenCache> {
        static GLOBAL: OnceLock<Arc<TokenCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TokenCache::new())).clone()
    }

    /// Return a valid cached token or obtain one with `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, client_email: &str, scope: &str, fetch: F) -> Result<Secret>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .entry((client_email.to_string(), scope.to_string()))
                .or_default()
                .clone()
        };

        let mut cached = slot.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.token.clone());
            }
        }

        info!(client_email, "Fetching access token");
        let token = fetch().await?;
        let secret = token.token.clone();
        *cached = Some(token);
        Ok(secret)
    }

    /// Drop every cached token.
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PEM: &str = include_str!("../../testdata/service_account_key.pem");
    const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";

    fn issuer(transport: Arc<MemoryTransport>) -> TokenIssuer {
        let jwt = JwtSigner::from_pem("reader@project.iam.gserviceaccount.com", PEM).unwrap();
        TokenIssuer::new(jwt, SCOPE, transport).unwrap()
    }

    fn token(value: &str, expires_in: Duration) -> AccessToken {
        AccessToken {
            token: Secret::new(value),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn test_token_expiration() {
        assert!(token("t", Duration::hours(-1)).is_expired());
        assert!(token("t", Duration::minutes(4)).is_expired());
        assert!(!token("t", Duration::hours(1)).is_expired());
    }

    #[tokio::test]
    async fn test_issue_posts_jwt_bearer_form() {
        let transport = Arc::new(MemoryTransport::new());
        let token = issuer(transport.clone()).issue().await.unwrap();

        assert_eq!(token.token.expose(), "memory-token-1");
        assert!(!token.is_expired());

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url.as_str(), TOKEN_URL);
        assert_eq!(
            request.headers[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        let form: HashMap<String, String> = url::form_urlencoded::parse(&request.body)
            .into_owned()
            .collect();
        assert_eq!(form["grant_type"], JWT_BEARER_GRANT);
        assert_eq!(form["assertion"].split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_authentication_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(400, r#"{"error":"invalid_grant"}"#);

        let err = issuer(transport).issue().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.status(), Some(400));
        assert!(err.response().unwrap().body_text().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_response_without_token_is_authentication_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(200, r#"{"token_type":"Bearer"}"#);

        let err = issuer(transport).issue().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.status(), Some(200));
    }

    #[tokio::test]
    async fn test_cache_reuses_valid_token() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("a@example.com", SCOPE, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token("cached", Duration::hours(1)))
                })
                .await
                .unwrap();
            assert_eq!(value.expose(), "cached");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_refreshes_expiring_token() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_fetch("a@example.com", SCOPE, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token("short", Duration::minutes(1)))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_keys_by_account_and_scope() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        for (email, scope) in [("a@x", "s1"), ("a@x", "s2"), ("b@x", "s1"), ("a@x", "s1")] {
            cache
                .get_or_fetch(email, scope, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token("t", Duration::hours(1)))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_single_flight() {
        let cache = TokenCache::new();
        let transport = Arc::new(MemoryTransport::new());
        let issuer = issuer(transport.clone());

        let results = futures::future::join_all((0..8).map(|_| {
            cache.get_or_fetch(issuer.client_email(), issuer.scope(), || issuer.issue())
        }))
        .await;

        for result in results {
            assert_eq!(result.unwrap().expose(), "memory-token-1");
        }
        assert_eq!(transport.token_exchanges(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = TokenCache::new();
        let err = cache
            .get_or_fetch("a@x", SCOPE, || async {
                Err(StorageError::new(Provider::Google, ErrorKind::Authentication, "denied"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let value = cache
            .get_or_fetch("a@x", SCOPE, || async { Ok(token("ok", Duration::hours(1))) })
            .await
            .unwrap();
        assert_eq!(value.expose(), "ok");
    }
}
