//! In-memory transport for testing.
//!
//! Emulates just enough of the S3, Azure Blob and Google Cloud Storage HTTP
//! APIs for providers to round-trip objects without a network, and lets
//! tests inject transport failures.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use url::Url;

use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};

const GCS_HOST: &str = "storage.googleapis.com";
const TOKEN_HOST: &str = "oauth2.googleapis.com";

/// Request observed by the memory transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
enum Failure {
    Disconnect,
    Status(u16, Bytes),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    requests: Vec<RecordedRequest>,
    token_exchanges: usize,
    pending_failures: Vec<Failure>,
    truncate_downloads_after: Option<usize>,
}

/// In-memory object store speaking the providers' HTTP dialects.
///
/// Requests without an `Authorization` header are rejected with 403 so
/// that unsigned requests never pass silently.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next request without producing a response.
    pub fn disconnect_next(&self) {
        self.state().pending_failures.push(Failure::Disconnect);
    }

    /// Answer the next request with the given status and body.
    pub fn fail_next(&self, status: u16, body: impl Into<Bytes>) {
        self.state()
            .pending_failures
            .push(Failure::Status(status, body.into()));
    }

    /// Make object downloads emit `limit` bytes and then a stream error.
    pub fn truncate_downloads_after(&self, limit: usize) {
        self.state().truncate_downloads_after = Some(limit);
    }

    /// Identifiers of stored objects, e.g. `bucket.s3.amazonaws.com/dir/a.txt`.
    pub fn object_ids(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Number of OAuth token exchanges served.
    pub fn token_exchanges(&self) -> usize {
        self.state().token_exchanges
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    /// Most recent request.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state().requests.last().cloned()
    }

    fn handle_token(&self, body: &Bytes) -> HttpResponse {
        let form = String::from_utf8_lossy(body);
        let grant_ok = form.contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer");
        let assertion_ok = form
            .split('&')
            .any(|pair| pair.starts_with("assertion=") && pair.len() > "assertion=".len());

        if !grant_ok || !assertion_ok {
            return json_response(400, r#"{"error":"invalid_grant"}"#.to_string());
        }

        let mut state = self.state();
        state.token_exchanges += 1;
        let body = serde_json::json!({
            "access_token": format!("memory-token-{}", state.token_exchanges),
            "expires_in": 3600,
            "token_type": "Bearer",
        });
        json_response(200, body.to_string())
    }

    fn handle_gcs(&self, method: &Method, url: &Url, body: Bytes) -> HttpResponse {
        let segments: Vec<&str> = url.path().trim_start_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            (&Method::POST, ["upload", "storage", "v1", "b", bucket, "o"]) => {
                let name = url
                    .query_pairs()
                    .find(|(k, _)| k == "name")
                    .map(|(_, v)| v.into_owned());
                let Some(name) = name else {
                    return json_response(400, r#"{"error":"missing name"}"#.to_string());
                };
                let size = body.len();
                self.state()
                    .objects
                    .insert(format!("{}/{}/{}", GCS_HOST, bucket, name), body);
                let receipt = serde_json::json!({
                    "kind": "storage#object",
                    "bucket": bucket,
                    "name": name,
                    "size": size.to_string(),
                });
                json_response(200, receipt.to_string())
            }
            (_, ["storage", "v1", "b", bucket, "o", encoded]) => {
                let name = percent_decode_str(encoded).decode_utf8_lossy();
                let id = format!("{}/{}/{}", GCS_HOST, bucket, name);
                self.handle_object(method, id, body)
            }
            _ => json_response(404, r#"{"error":"unknown route"}"#.to_string()),
        }
    }

    fn handle_object(&self, method: &Method, id: String, body: Bytes) -> HttpResponse {
        let mut state = self.state();
        match *method {
            Method::PUT | Method::POST => {
                let etag = format!("\"{}\"", hex::encode(&Sha256::digest(&body)[..16]));
                state.objects.insert(id, body);
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&etag) {
                    headers.insert(ETAG, value);
                }
                HttpResponse::from_bytes(201, headers, Bytes::new())
            }
            Method::GET => match state.objects.get(&id).cloned() {
                Some(data) => match state.truncate_downloads_after {
                    Some(limit) if limit < data.len() => truncated_response(data.slice(..limit)),
                    _ => HttpResponse::from_bytes(200, HeaderMap::new(), data),
                },
                None => HttpResponse::from_bytes(404, HeaderMap::new(), "NoSuchKey"),
            },
            Method::DELETE => match state.objects.remove(&id) {
                Some(_) => HttpResponse::from_bytes(204, HeaderMap::new(), Bytes::new()),
                None => HttpResponse::from_bytes(404, HeaderMap::new(), "NoSuchKey"),
            },
            _ => HttpResponse::from_bytes(405, HeaderMap::new(), Bytes::new()),
        }
    }

    fn handle_list(&self, host: &str, url: &Url) -> HttpResponse {
        let prefix = url
            .query_pairs()
            .find(|(k, _)| k == "prefix")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        let bucket = host.split('.').next().unwrap_or_default();
        let base = format!("{}/", host);

        let state = self.state();
        let keys: Vec<&str> = state
            .objects
            .keys()
            .filter_map(|id| id.strip_prefix(&base))
            .filter(|key| key.starts_with(&prefix))
            .collect();

        let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push_str(r#"<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#);
        xml.push_str(&format!("<Name>{}</Name>", quick_xml::escape::escape(bucket)));
        xml.push_str(&format!("<Prefix>{}</Prefix>", quick_xml::escape::escape(&prefix)));
        xml.push_str(&format!("<KeyCount>{}</KeyCount>", keys.len()));
        xml.push_str("<MaxKeys>1000</MaxKeys><IsTruncated>false</IsTruncated>");
        for key in keys {
            let size = state.objects.get(&format!("{}{}", base, key)).map_or(0, |b| b.len());
            xml.push_str(&format!(
                "<Contents><Key>{}</Key><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
                quick_xml::escape::escape(key),
                size
            ));
        }
        xml.push_str("</ListBucketResult>");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        HttpResponse::from_bytes(200, headers, xml)
    }
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Request(format!("Failed to read request body: {}", e)))?;

        let failure = {
            let mut state = self.state();
            state.requests.push(RecordedRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            });
            if state.pending_failures.is_empty() {
                None
            } else {
                Some(state.pending_failures.remove(0))
            }
        };

        match failure {
            Some(Failure::Disconnect) => {
                return Err(TransportError::Connect("connection reset by peer".to_string()));
            }
            Some(Failure::Status(status, body)) => {
                return Ok(HttpResponse::from_bytes(status, HeaderMap::new(), body));
            }
            None => {}
        }

        let host = url.host_str().unwrap_or_default().to_string();

        if host == TOKEN_HOST {
            return Ok(self.handle_token(&body));
        }

        if !headers.contains_key(AUTHORIZATION) {
            return Ok(HttpResponse::from_bytes(403, HeaderMap::new(), "missing Authorization"));
        }

        if host == GCS_HOST {
            return Ok(self.handle_gcs(&method, &url, body));
        }

        if method == Method::GET && url.query_pairs().any(|(k, v)| k == "list-type" && v == "2") {
            return Ok(self.handle_list(&host, &url));
        }

        let path = percent_decode_str(url.path()).decode_utf8_lossy();
        Ok(self.handle_object(&method, format!("{}{}", host, path), body))
    }
}

fn json_response(status: u16, body: String) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    HttpResponse::from_bytes(status, headers, body)
}

fn truncated_response(partial: Bytes) -> HttpResponse {
    let chunks = vec![
        Ok(partial),
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset mid-body",
        )),
    ];
    HttpResponse {
        status: 200,
        headers: HeaderMap::new(),
        body: Box::pin(stream::iter(chunks)),
    }
}
