//! Production transport backed by `reqwest`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Body, Client};
use std::io;

use super::{HttpRequest, HttpResponse, HttpTransport, RequestBody, TransportError};

/// [`HttpTransport`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Create a transport with a default client.
    ///
    /// # Errors
    /// - TLS backend could not be initialized
    pub fn new() -> Result<Self, TransportError> {
        let http = Client::builder()
            .user_agent(concat!("CloudStash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    /// Wrap an existing client, e.g. one configured with proxies or timeouts.
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.http.request(method, url).headers(headers);

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Stream { stream, length } => {
                let builder = builder.body(Body::wrap_stream(stream));
                match length {
                    Some(length) => builder.header(header::CONTENT_LENGTH, length),
                    None => builder,
                }
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));

        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
