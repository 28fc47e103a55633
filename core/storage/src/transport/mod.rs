//! HTTP transport abstraction.
//!
//! Providers build fully signed requests and hand them to an
//! [`HttpTransport`]. The transport reports failures to reach the server
//! through [`TransportError`]; any status the server returns, including
//! 4xx/5xx, comes back as an ordinary [`HttpResponse`].

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::fmt;
use std::io;
use std::pin::Pin;
use thiserror::Error;
use url::Url;

pub use http::ReqwestTransport;
pub use memory::MemoryTransport;

/// Byte stream used for streaming request and response bodies.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Failure to obtain any response from the server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established or was dropped.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The request could not be sent or its response headers not read.
    #[error("Request failed: {0}")]
    Request(String),

    /// The transport rejected the request before sending it.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Request payload.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streamed body, with its length when known up front.
    Stream {
        stream: ByteStream,
        length: Option<u64>,
    },
}

impl RequestBody {
    /// Body length, if known before sending.
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(bytes) => Some(bytes.len() as u64),
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Bytes(bytes) => Ok(bytes),
            RequestBody::Stream { stream, .. } => collect_stream(stream).await,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::Stream { length, .. } => write!(f, "Stream(length: {:?})", length),
        }
    }
}

/// A request ready to be put on the wire.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// A response as returned by the server, with a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl HttpResponse {
    /// Response with a fully buffered body.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers,
            body: Box::pin(stream::once(async move { Ok(body) })),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Read the whole body into memory.
    pub async fn bytes(self) -> io::Result<Bytes> {
        collect_stream(self.body).await
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Something that can execute HTTP requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and return the server's response, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub(crate) async fn collect_stream(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
