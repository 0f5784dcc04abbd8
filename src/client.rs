//! Translation of document operations into HTTP requests.
//!
//! The [`FeedClient`] is stateless beyond its configuration and a
//! round-robin cursor over the supplied transports, so one client can be
//! shared by any number of concurrent callers. Received HTTP statuses,
//! including 4xx/5xx, are data in the [`FeedResult`]; only transport-level
//! failures (timeout, refused connection, TLS) become errors.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use reqwest::Method;
use url::Url;

use crate::document::{Document, Operation};

/// Errors from transports are uniform boxed trait objects; implementors
/// convert their upstream errors into this.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// One HTTP exchange, transport-agnostic.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A thing that can perform one HTTP request. Implementations must be safe
/// for concurrent use; pooled HTTP clients already are.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] over a pooled [`reqwest::Client`].
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder()
            .build()
            .map_err(ClientError::BuildTransport)?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .inner
            .request(request.method, request.url)
            .timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }
}

/// Construction-time client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("at least one transport is required")]
    NoTransports,

    #[error("base URL '{0}' cannot carry a path")]
    BaseUrl(Url),

    #[error("failed to build HTTP transport: {0}")]
    BuildTransport(#[source] reqwest::Error),
}

/// Whether request bodies are gzip-compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Compress bodies of [`AUTO_COMPRESS_MIN_BYTES`] or more.
    #[default]
    Auto,
    Always,
    Never,
}

/// Below this size, `Compression::Auto` sends bodies uncompressed.
pub const AUTO_COMPRESS_MIN_BYTES: usize = 1024;

impl Compression {
    fn should_compress(self, body_len: usize) -> bool {
        match self {
            Compression::Auto => body_len >= AUTO_COMPRESS_MIN_BYTES,
            Compression::Always => body_len > 0,
            Compression::Never => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: Url,
    /// Per-request timeout, bounding each individual HTTP call.
    pub timeout: Duration,
    pub compression: Compression,
}

impl ClientOptions {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            compression: Compression::default(),
        }
    }
}

/// The terminal outcome of one dispatched operation.
///
/// Exactly one of `status`/`error` is set. Interpretation of status codes
/// is left to the caller.
#[derive(Debug)]
pub struct FeedResult {
    pub status: Option<u16>,
    pub body: Bytes,
    pub error: Option<TransportError>,
    /// Request body bytes as put on the wire (after compression).
    pub bytes_sent: u64,
}

impl FeedResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(status) if (200..300).contains(&status))
    }

    fn transport_failure(error: TransportError, bytes_sent: u64) -> Self {
        Self {
            status: None,
            body: Bytes::new(),
            error: Some(error),
            bytes_sent,
        }
    }
}

/// Issues document operations against the store's document API.
pub struct FeedClient {
    opts: ClientOptions,
    transports: Vec<Arc<dyn Transport>>,
    cursor: AtomicUsize,
}

impl FeedClient {
    /// A client over the given transports. Requests round-robin across
    /// them to spread load over independent connection pools.
    pub fn new(
        opts: ClientOptions,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self, ClientError> {
        if transports.is_empty() {
            return Err(ClientError::NoTransports);
        }
        if opts.base_url.cannot_be_a_base() {
            return Err(ClientError::BaseUrl(opts.base_url));
        }
        Ok(Self {
            opts,
            transports,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Convenience constructor building `connections` reqwest transports.
    pub fn with_connections(opts: ClientOptions, connections: usize) -> Result<Self, ClientError> {
        let transports = (0..connections.max(1))
            .map(|_| Ok(Arc::new(ReqwestTransport::new()?) as Arc<dyn Transport>))
            .collect::<Result<Vec<_>, ClientError>>()?;
        Self::new(opts, transports)
    }

    /// Issue the document's own operation.
    pub async fn send(&self, doc: &Document) -> FeedResult {
        self.execute(doc, doc.operation).await
    }

    /// Fetch the document, regardless of its operation. No body is sent.
    pub async fn get(&self, doc: &Document) -> FeedResult {
        self.execute(doc, Operation::Get).await
    }

    async fn execute(&self, doc: &Document, operation: Operation) -> FeedResult {
        let request = match self.build_request(doc, operation) {
            Ok(request) => request,
            Err(error) => return FeedResult::transport_failure(error, 0),
        };
        let bytes_sent = request.body.as_ref().map_or(0, |body| body.len() as u64);
        let transport = self.next_transport();
        match transport.roundtrip(request).await {
            Ok(response) => FeedResult {
                status: Some(response.status),
                body: response.body,
                error: None,
                bytes_sent,
            },
            Err(error) => FeedResult::transport_failure(error, bytes_sent),
        }
    }

    fn build_request(
        &self,
        doc: &Document,
        operation: Operation,
    ) -> Result<HttpRequest, TransportError> {
        let method = match operation {
            Operation::Put => Method::POST,
            Operation::Update => Method::PUT,
            Operation::Remove => Method::DELETE,
            Operation::Get => Method::GET,
        };

        let mut url = self.opts.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| format!("base URL '{}' cannot carry a path", self.opts.base_url))?;
            segments.pop_if_empty();
            segments.push("document");
            segments.push("v1");
            // Url escapes each pushed segment, which is the only escaping
            // applied to id parts.
            for segment in doc.id.path_segments() {
                segments.push(&segment);
            }
        }
        if let Some(condition) = &doc.condition {
            url.query_pairs_mut().append_pair("condition", condition);
        }
        if doc.create {
            url.query_pairs_mut().append_pair("create", "true");
        }

        let mut headers = Vec::new();
        let body = if operation.has_body() {
            match &doc.body {
                Some(raw) => {
                    headers.push(("content-type", "application/json"));
                    if self.opts.compression.should_compress(raw.len()) {
                        headers.push(("content-encoding", "gzip"));
                        Some(Bytes::from(gzip(raw)?))
                    } else {
                        Some(raw.clone())
                    }
                }
                None => None,
            }
        } else {
            None
        };

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: self.opts.timeout,
        })
    }

    fn next_transport(&self) -> Arc<dyn Transport> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.transports.len();
        Arc::clone(&self.transports[index])
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
