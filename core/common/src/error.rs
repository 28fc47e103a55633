//! Error taxonomy shared by every storage provider.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::types::Provider;

/// Category of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure, or a non-2xx response not covered by another kind.
    Network,
    /// Token exchange failed or the provider rejected the credentials.
    Authentication,
    /// Malformed signing inputs or missing provider configuration.
    Configuration,
    /// The provider refused to delete an object.
    FileDeletion,
    /// The backend does not implement the operation.
    Unsupported,
}

impl ErrorKind {
    /// Name used in diagnostics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NetworkError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::FileDeletion => "FileDeletionError",
            ErrorKind::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP response captured for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response payload.
    pub body: Bytes,
}

impl ErrorResponse {
    /// Response body decoded lossily as UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure of a storage operation.
///
/// Every error names the provider it came from. When the provider answered,
/// the status and raw body are kept in `response`; when no response arrived
/// at all, `response` is `None` and `source` holds the transport failure.
#[derive(Debug, Error)]
#[error("{provider} {kind}: {message}")]
pub struct StorageError {
    provider: Provider,
    kind: ErrorKind,
    message: String,
    response: Option<ErrorResponse>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    /// Create an error without response context.
    pub fn new(provider: Provider, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
            response: None,
            source: None,
        }
    }

    /// Configuration error raised before any request is made.
    pub fn configuration(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::Configuration, message)
    }

    /// Operation not implemented by the backend.
    pub fn unsupported(provider: Provider, operation: &str) -> Self {
        Self::new(
            provider,
            ErrorKind::Unsupported,
            format!("{} is not supported by this backend", operation),
        )
    }

    /// The request never produced a response.
    pub fn no_response(
        provider: Provider,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            provider,
            kind: ErrorKind::Network,
            message: message.into(),
            response: None,
            source: Some(source.into()),
        }
    }

    /// The provider answered with an error status.
    ///
    /// 401 and 403 always classify as authentication failures; any other
    /// status takes `fallback`.
    pub fn from_status(
        provider: Provider,
        fallback: ErrorKind,
        message: impl Into<String>,
        status: u16,
        body: Bytes,
    ) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Authentication,
            _ => fallback,
        };
        Self {
            provider,
            kind,
            message: message.into(),
            response: Some(ErrorResponse { status, body }),
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status, when a response was received.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// Response captured with the error, if any.
    pub fn response(&self) -> Option<&ErrorResponse> {
        self.response.as_ref()
    }

    /// Whether this is a network failure where nothing came back.
    pub fn is_no_response(&self) -> bool {
        self.kind == ErrorKind::Network && self.response.is_none()
    }
}

/// Rejected object key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Key component cannot be empty")]
    EmptyComponent,

    #[error("Key component cannot contain separators: {0:?}")]
    Separator(String),

    /// `.` and `..` would be collapsed by URL normalization.
    #[error("Key component cannot be a relative segment: {0:?}")]
    RelativeSegment(String),
}

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;
