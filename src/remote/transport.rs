//! HTTP transport capability
//!
//! The connector talks to the backend only through [`Transport`], so tests
//! can substitute an in-process fake and the protocol workaround stays
//! independent of the HTTP client.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Body, Client, Method};
use tracing::trace;

use crate::asset::BodyStream;
use crate::error::{StoreError, StoreResult};

/// Request body as handed to the transport
pub enum RequestBody {
    Empty,
    /// Fully buffered; the client may replay it on its own
    Buffered(Bytes),
    /// Chunked stream of `length` bytes
    Streamed { stream: BodyStream, length: u64 },
}

impl RequestBody {
    pub fn is_streamed(&self) -> bool {
        matches!(self, RequestBody::Streamed { .. })
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            RequestBody::Streamed { length, .. } => write!(f, "Streamed({} bytes)", length),
        }
    }
}

/// A single HTTP exchange
#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Whole-exchange deadline
    pub timeout: Duration,
    /// When false the body must go out as a one-shot stream, never as a
    /// buffer the client could replay
    pub allow_write_buffering: bool,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout,
            allow_write_buffering: true,
        }
    }
}

/// Response head plus a streamed body
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body as text, for error messages
    pub async fn text(self) -> String {
        let mut out = Vec::new();
        let mut body = self.body;
        while let Ok(Some(chunk)) = body.try_next().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Narrow capability for performing HTTP exchanges
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> StoreResult<TransportResponse>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new() -> StoreResult<Self> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| StoreError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> StoreResult<TransportResponse> {
        trace!(
            method = %request.method,
            url = %request.url,
            body = ?request.body,
            buffering = request.allow_write_buffering,
            "HTTP request"
        );

        let body = match request.body {
            RequestBody::Empty => None,
            RequestBody::Buffered(bytes) if request.allow_write_buffering => Some(Body::from(bytes)),
            RequestBody::Buffered(bytes) => {
                Some(Body::wrap_stream(stream::once(async move { Ok::<_, StoreError>(bytes) })))
            }
            RequestBody::Streamed { stream, .. } => Some(Body::wrap_stream(stream)),
        };

        let mut builder = self
            .http_client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(classify).boxed();

        Ok(TransportResponse { status, headers, body })
    }
}

/// Map a client failure onto the store's error taxonomy
fn classify(e: reqwest::Error) -> StoreError {
    if e.is_timeout() || has_io_timeout(&e) {
        StoreError::Timeout
    } else if e.is_connect() {
        StoreError::Connectivity(error_chain(&e))
    } else if e.is_body() || e.is_decode() || is_protocol_violation(&e) {
        StoreError::Protocol(error_chain(&e))
    } else {
        StoreError::Connectivity(error_chain(&e))
    }
}

fn sources(e: &reqwest::Error) -> impl Iterator<Item = &(dyn StdError + 'static)> {
    let mut next: Option<&(dyn StdError + 'static)> = e.source();
    std::iter::from_fn(move || {
        let current = next?;
        next = current.source();
        Some(current)
    })
}

fn has_io_timeout(e: &reqwest::Error) -> bool {
    sources(e).any(|s| {
        s.downcast_ref::<std::io::Error>()
            .map_or(false, |io| io.kind() == std::io::ErrorKind::TimedOut)
    })
}

/// The HTTP stack reports malformed or wrong-version responses only as text
fn is_protocol_violation(e: &reqwest::Error) -> bool {
    sources(e).any(|s| {
        let msg = s.to_string().to_lowercase();
        msg.contains("parse") || msg.contains("version") || msg.contains("protocol")
    })
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    for source in sources(e) {
        out.push_str(": ");
        out.push_str(&source.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_text_drains_body() {
        let response = TransportResponse {
            status: 500,
            headers: HeaderMap::new(),
            body: crate::asset::chunk_bytes(Bytes::from_static(b"backend exploded"), 4),
        };
        assert!(!response.is_success());
        assert_eq!(response.text().await, "backend exploded");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connectivity_or_timeout() {
        let transport = HttpTransport::new().unwrap();
        let request = TransportRequest::new(
            Method::GET,
            "http://127.0.0.1:1/assets/x",
            Duration::from_secs(2),
        );
        let err = transport.execute(request).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
