//! Upload source and download sink normalization.
//!
//! Callers hand providers a path, a buffer or a stream to upload, and ask for
//! downloads as a buffer, a stream or a file. [`TransferCoordinator`] turns
//! those into the byte-level shapes each signer needs, sends signed requests,
//! and classifies failures into [`StorageError`]s.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use cloudstash_common::{ErrorKind, Provider, Result, StorageError};

use crate::aws;
use crate::signing::Payload;
use crate::transport::{
    collect_stream, ByteStream, HttpRequest, HttpResponse, HttpTransport, RequestBody,
};

/// Data to upload.
pub enum UploadSource {
    /// Local file, read by the coordinator.
    Path(PathBuf),
    /// In-memory bytes.
    Bytes(Bytes),
    /// Readable byte stream of unknown length.
    Stream(ByteStream),
}

impl UploadSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        UploadSource::Path(path.into())
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        UploadSource::Bytes(data.into())
    }

    pub fn stream(stream: ByteStream) -> Self {
        UploadSource::Stream(stream)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(data: Vec<u8>) -> Self {
        UploadSource::Bytes(Bytes::from(data))
    }
}

impl From<Bytes> for UploadSource {
    fn from(data: Bytes) -> Self {
        UploadSource::Bytes(data)
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Path(path) => write!(f, "Path({})", path.display()),
            UploadSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            UploadSource::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Where a download should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSink {
    /// Materialize the whole object in memory.
    Buffer,
    /// Hand back the live response stream.
    Stream,
    /// Write the object to a local file.
    File(PathBuf),
}

/// Result of a download, matching the requested [`DownloadSink`].
pub enum Downloaded {
    Buffer(Bytes),
    Stream(ByteStream),
    File { path: PathBuf, bytes_written: u64 },
}

impl Downloaded {
    /// Buffered content, if this was a buffer download.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Downloaded::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Read the content into memory regardless of sink.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Downloaded::Buffer(bytes) => Ok(bytes),
            Downloaded::Stream(stream) => collect_stream(stream).await,
            Downloaded::File { path, .. } => fs::read(path).await.map(Bytes::from),
        }
    }
}

impl fmt::Debug for Downloaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Downloaded::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Downloaded::Stream(_) => write!(f, "Stream"),
            Downloaded::File {
                path,
                bytes_written,
            } => write!(f, "File({}, {} bytes)", path.display(), bytes_written),
        }
    }
}

/// Operation a request belongs to, used to classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
    Delete,
    List,
    TokenExchange,
}

impl Operation {
    fn failure_message(&self) -> &'static str {
        match self {
            Operation::Upload => "Failed to upload file",
            Operation::Download => "Failed to download file",
            Operation::Delete => "Failed to delete file",
            Operation::List => "Failed to list files",
            Operation::TokenExchange => "Failed to exchange token",
        }
    }

    fn status_kind(&self) -> ErrorKind {
        match self {
            Operation::Delete => ErrorKind::FileDeletion,
            Operation::TokenExchange => ErrorKind::Authentication,
            _ => ErrorKind::Network,
        }
    }
}

/// Normalizes transfer payloads and executes signed requests for one provider.
#[derive(Debug, Clone, Copy)]
pub struct TransferCoordinator {
    provider: Provider,
}

impl TransferCoordinator {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Resolve a source into memory.
    ///
    /// Used by signers that need the full payload (hash or exact length)
    /// before the request can be signed.
    ///
    /// # Errors
    /// - Configuration error if the local file or stream cannot be read
    pub async fn buffer_source(&self, source: UploadSource) -> Result<Bytes> {
        match source {
            UploadSource::Bytes(bytes) => Ok(bytes),
            UploadSource::Path(path) => fs::read(&path).await.map(Bytes::from).map_err(|e| {
                StorageError::configuration(
                    self.provider,
                    format!("Failed to read upload source {}", path.display()),
                )
                .with_source(e)
            }),
            UploadSource::Stream(stream) => collect_stream(stream).await.map_err(|e| {
                StorageError::configuration(self.provider, "Failed to read upload stream")
                    .with_source(e)
            }),
        }
    }

    /// Resolve a source into a request body without buffering.
    ///
    /// Files are streamed with their length; caller streams pass through
    /// with unknown length.
    pub async fn stream_source(&self, source: UploadSource) -> Result<(RequestBody, Payload)> {
        match source {
            UploadSource::Bytes(bytes) => {
                let payload = Payload::Bytes(bytes.clone());
                Ok((RequestBody::Bytes(bytes), payload))
            }
            UploadSource::Path(path) => {
                let file = File::open(&path).await.map_err(|e| {
                    StorageError::configuration(
                        self.provider,
                        format!("Failed to open upload source {}", path.display()),
                    )
                    .with_source(e)
                })?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|e| {
                        StorageError::configuration(
                            self.provider,
                            format!("Failed to stat upload source {}", path.display()),
                        )
                        .with_source(e)
                    })?
                    .len();

                let body = RequestBody::Stream {
                    stream: Box::pin(ReaderStream::new(file)),
                    length: Some(length),
                };
                Ok((body, Payload::Streaming { length: Some(length) }))
            }
            UploadSource::Stream(stream) => Ok((
                RequestBody::Stream {
                    stream,
                    length: None,
                },
                Payload::Streaming { length: None },
            )),
        }
    }

    /// Send a request and turn anything but a 2xx response into an error.
    ///
    /// A transport failure yields a network error with no response; an error
    /// status yields an error carrying the status and raw body.
    pub async fn dispatch(
        &self,
        transport: &dyn HttpTransport,
        request: HttpRequest,
        operation: Operation,
    ) -> Result<HttpResponse> {
        debug!(provider = %self.provider, method = %request.method, url = %request.url, "Sending request");

        let response = transport.send(request).await.map_err(|e| {
            warn!(provider = %self.provider, ?operation, error = %e, "No response received");
            StorageError::no_response(self.provider, operation.failure_message(), e)
        })?;

        if response.is_success() {
            return Ok(response);
        }

        let HttpResponse {
            status,
            headers,
            body,
        } = response;
        let body = collect_stream(body).await.unwrap_or_default();
        warn!(provider = %self.provider, ?operation, status, "Request failed");

        let kind = if self.rejects_credentials(status, &headers, &body) {
            ErrorKind::Authentication
        } else {
            operation.status_kind()
        };
        Err(StorageError::from_status(
            self.provider,
            kind,
            operation.failure_message(),
            status,
            body,
        ))
    }

    /// Provider-specific statuses other than 401/403 that mean the
    /// credentials or their scope were refused.
    fn rejects_credentials(&self, status: u16, headers: &HeaderMap, body: &[u8]) -> bool {
        match self.provider {
            Provider::Aws => aws::errors::rejects_credentials(status, headers, body),
            Provider::Google | Provider::Azure => false,
        }
    }

    /// Resolve a successful response body into the requested sink.
    ///
    /// File downloads are written to a uniquely named sibling partial file
    /// and renamed into place only after every byte is written and synced.
    /// On any stream or write error the partial file is removed and the
    /// download fails.
    pub async fn deliver(&self, response: HttpResponse, sink: DownloadSink) -> Result<Downloaded> {
        let status = response.status;

        match sink {
            DownloadSink::Buffer => {
                let bytes = response.bytes().await.map_err(|e| {
                    StorageError::from_status(
                        self.provider,
                        ErrorKind::Network,
                        "Failed to read response body",
                        status,
                        Bytes::new(),
                    )
                    .with_source(e)
                })?;
                Ok(Downloaded::Buffer(bytes))
            }
            DownloadSink::Stream => Ok(Downloaded::Stream(response.body)),
            DownloadSink::File(path) => {
                if path.file_name().is_none() {
                    return Err(StorageError::configuration(
                        self.provider,
                        format!("Invalid download destination {}", path.display()),
                    ));
                }

                match write_file(response.body, &path).await {
                    Ok(bytes_written) => {
                        debug!(provider = %self.provider, path = %path.display(), bytes_written, "Download written");
                        Ok(Downloaded::File {
                            path,
                            bytes_written,
                        })
                    }
                    Err(e) => {
                        warn!(provider = %self.provider, path = %path.display(), error = %e, "Download aborted");
                        Err(StorageError::from_status(
                            self.provider,
                            ErrorKind::Network,
                            "Failed to download file",
                            status,
                            Bytes::new(),
                        )
                        .with_source(e))
                    }
                }
            }
        }
    }
}

/// Hidden, uniquely named sibling of `destination`.
///
/// Concurrent downloads to one destination each get their own file. The
/// file is deleted when dropped unless it has been persisted.
fn partial_file(destination: &Path) -> io::Result<NamedTempFile> {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".partial")
        .tempfile_in(dir)
}

async fn write_file(mut body: ByteStream, destination: &Path) -> io::Result<u64> {
    let (file, partial) = partial_file(destination)?.into_parts();
    let mut file = File::from_std(file);
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    partial.persist(destination)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportError};
    use futures::stream;
    use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
    use reqwest::Method;
    use tempfile::TempDir;
    use url::Url;

    fn chunked(chunks: Vec<io::Result<Bytes>>) -> ByteStream {
        Box::pin(stream::iter(chunks))
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn get(url: &str) -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("test"));
        HttpRequest {
            method: Method::GET,
            url: Url::parse(url).unwrap(),
            headers,
            body: RequestBody::Empty,
        }
    }

    #[tokio::test]
    async fn test_buffer_source_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, b"a,b,c\n").unwrap();

        let coordinator = TransferCoordinator::new(Provider::Aws);
        let bytes = coordinator.buffer_source(UploadSource::path(&path)).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"a,b,c\n"));
    }

    #[tokio::test]
    async fn test_buffer_source_missing_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let coordinator = TransferCoordinator::new(Provider::Azure);
        let err = coordinator
            .buffer_source(UploadSource::path(dir.path().join("missing")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_buffer_source_from_stream() {
        let coordinator = TransferCoordinator::new(Provider::Aws);
        let source = UploadSource::stream(chunked(vec![
            Ok(Bytes::from_static(b"one ")),
            Ok(Bytes::from_static(b"two")),
        ]));
        let bytes = coordinator.buffer_source(source).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"one two"));
    }

    #[tokio::test]
    async fn test_stream_source_from_path_knows_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![7u8; 1024]).unwrap();

        let coordinator = TransferCoordinator::new(Provider::Google);
        let (body, payload) = coordinator.stream_source(UploadSource::path(&path)).await.unwrap();
        assert_eq!(body.length(), Some(1024));
        assert_eq!(payload.length(), Some(1024));
        assert_eq!(body.collect().await.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_deliver_to_file() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.txt");
        let response = HttpResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: chunked(vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"file"))]),
        };

        let coordinator = TransferCoordinator::new(Provider::Aws);
        let result = coordinator
            .deliver(response, DownloadSink::File(destination.clone()))
            .await
            .unwrap();

        match result {
            Downloaded::File { bytes_written, .. } => assert_eq!(bytes_written, 10),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello file");
        assert_eq!(entries(dir.path()), vec!["out.txt"]);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_to_same_destination() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("shared.bin");
        let coordinator = TransferCoordinator::new(Provider::Aws);

        let response = |byte: u8| HttpResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: chunked(
                (0..16)
                    .map(|_| Ok(Bytes::from(vec![byte; 1024])))
                    .collect(),
            ),
        };

        let (first, second) = tokio::join!(
            coordinator.deliver(response(b'a'), DownloadSink::File(destination.clone())),
            coordinator.deliver(response(b'b'), DownloadSink::File(destination.clone())),
        );
        first.unwrap();
        second.unwrap();

        // Whichever finished last wins, but never a mix of both.
        let written = std::fs::read(&destination).unwrap();
        assert_eq!(written.len(), 16 * 1024);
        assert!(written.iter().all(|b| *b == written[0]));
        assert_eq!(entries(dir.path()), vec!["shared.bin"]);
    }

    #[tokio::test]
    async fn test_deliver_to_file_fails_on_stream_error() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.txt");
        let response = HttpResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: chunked(vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            ]),
        };

        let coordinator = TransferCoordinator::new(Provider::Google);
        let err = coordinator
            .deliver(response, DownloadSink::File(destination.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!destination.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_deliver_to_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("no-such-dir").join("out.txt");
        let response = HttpResponse::from_bytes(200, HeaderMap::new(), "data");

        let coordinator = TransferCoordinator::new(Provider::Azure);
        let err = coordinator
            .deliver(response, DownloadSink::File(destination.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_dispatch_without_response() {
        let transport = MemoryTransport::new();
        transport.disconnect_next();

        let coordinator = TransferCoordinator::new(Provider::Aws);
        let err = coordinator
            .dispatch(&transport, get("https://b.s3.amazonaws.com/a"), Operation::Download)
            .await
            .unwrap_err();

        assert!(err.is_no_response());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<TransportError>().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_classifies_status() {
        let transport = MemoryTransport::new();
        let coordinator = TransferCoordinator::new(Provider::Azure);

        transport.fail_next(403, "AuthenticationFailed");
        let err = coordinator
            .dispatch(&transport, get("https://acct.blob.core.windows.net/c/a"), Operation::Download)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.response().unwrap().body_text(), "AuthenticationFailed");

        transport.fail_next(404, "BlobNotFound");
        let err = coordinator
            .dispatch(&transport, get("https://acct.blob.core.windows.net/c/a"), Operation::Delete)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileDeletion);
        assert_eq!(err.status(), Some(404));

        transport.fail_next(500, "InternalError");
        let err = coordinator
            .dispatch(&transport, get("https://acct.blob.core.windows.net/c/a"), Operation::Upload)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_no_response());
    }
}
