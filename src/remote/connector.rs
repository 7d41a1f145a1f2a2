//! Remote object store client
//!
//! Streams assets to and from an HTTP object store. Objects are addressed as
//! `<remote_url>/<container>/<object>`; see [`AssetId::container_name`] and
//! [`AssetId::object_name`].
//!
//! The connector makes no retries of its own except one: a protocol
//! violation is replayed once, after a short pause, with write buffering
//! disabled. Everything else is left to the commit queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

use base64::Engine;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH,
};
use reqwest::Method;
use tracing::{debug, error, info, warn};

use super::transport::{RequestBody, Transport, TransportRequest};
use crate::asset::{digest_stream, limit_stream, to_unix_millis, AssetId, AssetMeta, BodyStream, Payload, PayloadSource};
use crate::error::{StoreError, StoreResult};
use crate::settings::StoreSettings;

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

pub const HEADER_SHA1: &str = "x-object-meta-sha1";
pub const HEADER_CREATED: &str = "x-object-meta-created";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub operation: String,
    pub asset: String,
    pub error: String,
}

/// Cumulative bytes-sent callback
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Per-upload knobs
#[derive(Clone)]
pub struct UploadOptions {
    /// Chunk size for streamed bodies
    pub buffer_size: usize,
    /// Transfer cap; the declared length becomes `min(size, cap)`
    pub max_length: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl UploadOptions {
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            buffer_size: settings.transfer_buffer_size,
            max_length: settings.max_transfer_bytes,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("buffer_size", &self.buffer_size)
            .field("max_length", &self.max_length)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// A fetched object: head metadata plus the streamed body
pub struct RemoteObject {
    pub content_type: String,
    /// From `Content-Length`, when the backend sent one
    pub size: Option<u64>,
    pub created_at: Option<u64>,
    pub sha1: Option<String>,
    pub body: BodyStream,
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .field("created_at", &self.created_at)
            .field("sha1", &self.sha1)
            .finish_non_exhaustive()
    }
}

/// Client for the remote object store
pub struct RemoteStore {
    transport: Arc<dyn Transport>,
    settings: Arc<StoreSettings>,
    base_url: String,
    /// Precomputed `Authorization` value, when credentials are configured
    auth_header: Option<HeaderValue>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: AtomicU8,
    /// Recent error log
    error_log: RwLock<VecDeque<ErrorEntry>>,
}

impl RemoteStore {
    pub fn new(settings: Arc<StoreSettings>, transport: Arc<dyn Transport>) -> StoreResult<Self> {
        let base_url = settings
            .remote_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| StoreError::Configuration("remote_url is required".to_string()))?;

        let auth_header = match (&settings.remote_username, &settings.remote_api_key) {
            (Some(user), Some(key)) => {
                let credentials = format!("{}:{}", user, key);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                let mut value = HeaderValue::from_str(&format!("Basic {}", encoded))
                    .map_err(|e| StoreError::Configuration(format!("Invalid remote credentials: {}", e)))?;
                value.set_sensitive(true);
                Some(value)
            }
            _ => None,
        };

        info!(remote = %base_url, authenticated = auth_header.is_some(), "Remote store client ready");

        Ok(Self {
            transport,
            settings,
            base_url,
            auth_header,
            health: AtomicU8::new(HEALTH_HEALTHY),
            error_log: RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY)),
        })
    }

    /// URL of the object holding `id`
    pub fn object_url(&self, id: &AssetId) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(&id.container_name(&self.settings.container_prefix)),
            urlencoding::encode(&id.object_name())
        )
    }

    /// Upload a payload. Bodies above the streaming threshold, and every body
    /// once buffering is disabled, go out as chunks of `options.buffer_size`.
    ///
    /// Returns `StoreError::AlreadyExists` when overwrite protection rejected
    /// the write because the object is already present.
    pub async fn store(&self, meta: &AssetMeta, payload: &Payload, options: &UploadOptions) -> StoreResult<()> {
        let started = Instant::now();
        let result = self
            .with_protocol_workaround("store", &meta.id, |allow_buffering| {
                self.try_store(meta, payload, options, allow_buffering)
            })
            .await;
        self.finish("store", &meta.id, &result, started);

        if result.is_ok() {
            debug!(asset = %meta.id, size = meta.size, "Stored asset remotely");
        }
        result
    }

    async fn try_store(
        &self,
        meta: &AssetMeta,
        payload: &Payload,
        options: &UploadOptions,
        allow_buffering: bool,
    ) -> StoreResult<()> {
        let length = options.max_length.map_or(payload.size, |cap| payload.size.min(cap));

        let mut request = TransportRequest::new(Method::PUT, self.object_url(&meta.id), self.settings.write_timeout());
        request.allow_write_buffering = allow_buffering;
        request.headers = self.upload_headers(meta, length)?;

        let buffered = match &payload.source {
            PayloadSource::Memory(bytes) if allow_buffering && length <= self.settings.streaming_threshold => {
                Some(bytes.slice(..length as usize))
            }
            _ => None,
        };

        request.body = match buffered {
            Some(bytes) => RequestBody::Buffered(bytes),
            None => {
                let stream = payload.open(options.buffer_size, Some(length)).await?;
                RequestBody::Streamed {
                    stream: with_progress(stream, options.progress.clone()),
                    length,
                }
            }
        };
        let was_buffered = !request.body.is_streamed();

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            let status = response.status;
            let body = response.text().await;
            return Err(StoreError::from_status(status, &body));
        }

        if was_buffered {
            if let Some(progress) = &options.progress {
                progress(length);
            }
        }
        Ok(())
    }

    /// Upload a body that cannot be re-opened. Makes exactly one attempt:
    /// a protocol violation surfaces because the body is already consumed.
    pub async fn store_stream(&self, meta: &AssetMeta, stream: BodyStream, options: &UploadOptions) -> StoreResult<()> {
        let started = Instant::now();
        let length = options.max_length.map_or(meta.size, |cap| meta.size.min(cap));

        let result: StoreResult<()> = async {
            let mut request =
                TransportRequest::new(Method::PUT, self.object_url(&meta.id), self.settings.write_timeout());
            request.allow_write_buffering = false;
            request.headers = self.upload_headers(meta, length)?;
            request.body = RequestBody::Streamed {
                stream: with_progress(limit_stream(stream, length), options.progress.clone()),
                length,
            };

            let response = self.transport.execute(request).await?;
            if response.is_success() {
                Ok(())
            } else {
                let status = response.status;
                let body = response.text().await;
                Err(StoreError::from_status(status, &body))
            }
        }
        .await;

        if let Err(StoreError::Protocol(_)) = &result {
            warn!(asset = %meta.id, "Protocol violation on a one-shot upload; body cannot be replayed");
        }
        self.finish("store", &meta.id, &result, started);
        result
    }

    fn upload_headers(&self, meta: &AssetMeta, length: u64) -> StoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let content_type = if meta.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            &meta.content_type
        };
        headers.insert(CONTENT_TYPE, header_value(content_type)?);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        if !meta.sha1.is_empty() {
            headers.insert(HeaderName::from_static(HEADER_SHA1), header_value(&meta.sha1)?);
        }
        headers.insert(HeaderName::from_static(HEADER_CREATED), HeaderValue::from(meta.created_at));
        if self.settings.overwrite_protection {
            headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        }
        if let Some(auth) = &self.auth_header {
            headers.insert(AUTHORIZATION, auth.clone());
        }
        Ok(headers)
    }

    /// Download an object as a stream, bounded by the read timeout
    pub async fn fetch(&self, id: &AssetId) -> StoreResult<RemoteObject> {
        let started = Instant::now();
        let result = self
            .with_protocol_workaround("fetch", id, |_| self.try_fetch(id))
            .await;
        self.finish("fetch", id, &result, started);
        result
    }

    /// Check that the object already stored under `meta.id` holds the same
    /// bytes. Uses the stored sha1 header when present and digests the
    /// remote body otherwise.
    pub async fn confirm_existing(&self, meta: &AssetMeta) -> StoreResult<()> {
        let object = self.fetch(&meta.id).await?;
        let (size, sha1) = match (object.size, object.sha1) {
            (Some(size), Some(sha1)) => (size, sha1),
            _ => digest_stream(limit_stream(object.body, meta.size + 1)).await?,
        };

        if size == meta.size && sha1.eq_ignore_ascii_case(&meta.sha1) {
            debug!(asset = %meta.id, "Remote copy matches the stored content");
            Ok(())
        } else {
            warn!(
                asset = %meta.id,
                remote_size = size,
                local_size = meta.size,
                "Remote copy differs from the content being stored"
            );
            Err(StoreError::ImmutableViolation(meta.id.to_string()))
        }
    }

    async fn try_fetch(&self, id: &AssetId) -> StoreResult<RemoteObject> {
        let mut request = TransportRequest::new(Method::GET, self.object_url(id), self.settings.read_timeout());
        if let Some(auth) = &self.auth_header {
            request.headers.insert(AUTHORIZATION, auth.clone());
        }

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            let status = response.status;
            let body = response.text().await;
            return Err(match StoreError::from_status(status, &body) {
                StoreError::NotFound(_) => StoreError::NotFound(id.to_string()),
                other => other,
            });
        }

        let header = |name: &str| {
            response
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Ok(RemoteObject {
            content_type: header(CONTENT_TYPE.as_str()).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size: header(CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
            created_at: header(HEADER_CREATED).and_then(|v| v.parse().ok()),
            sha1: header(HEADER_SHA1),
            body: response.body,
        })
    }

    /// Run an operation, replaying it once with write buffering disabled if
    /// the first attempt hits a protocol violation
    async fn with_protocol_workaround<F, Fut, T>(&self, operation: &str, id: &AssetId, f: F) -> StoreResult<T>
    where
        F: Fn(bool) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        match f(true).await {
            Err(StoreError::Protocol(msg)) => {
                let pause = self.settings.protocol_retry_pause();
                warn!(
                    operation = operation,
                    asset = %id,
                    error = %msg,
                    pause_ms = pause.as_millis() as u64,
                    "Protocol violation, retrying once with write buffering disabled"
                );
                tokio::time::sleep(pause).await;
                f(false).await
            }
            other => other,
        }
    }

    /// Update health, error history and slow-operation logging
    fn finish<T>(&self, operation: &str, id: &AssetId, result: &StoreResult<T>, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_operation() {
            warn!(
                operation = operation,
                asset = %id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow remote operation"
            );
        }

        match result {
            Ok(_) => self.health.store(HEALTH_HEALTHY, Ordering::Relaxed),
            Err(StoreError::NotFound(_)) | Err(StoreError::AlreadyExists(_)) => {
                self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
            }
            Err(e) => {
                match e {
                    StoreError::Connectivity(_) | StoreError::Timeout => {
                        self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
                    }
                    StoreError::RateLimited | StoreError::Server(_, _) | StoreError::Protocol(_) => {
                        self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
                    }
                    _ => {}
                }
                error!(operation = operation, asset = %id, error = %e, "Remote operation failed");
                self.log_error(operation, id, &e.to_string());
            }
        }
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, operation: &str, id: &AssetId, error: &str) {
        let entry = ErrorEntry {
            timestamp: to_unix_millis(SystemTime::now()) / 1000,
            operation: operation.to_string(),
            asset: id.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().expect("error log lock poisoned");
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .expect("error log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

fn header_value(value: &str) -> StoreResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| StoreError::InvalidAsset(format!("invalid header value {:?}: {}", value, e)))
}

/// Report cumulative bytes as chunks are pulled by the transport
fn with_progress(stream: BodyStream, progress: Option<ProgressFn>) -> BodyStream {
    match progress {
        None => stream,
        Some(progress) => {
            let mut sent: u64 = 0;
            Box::pin(stream.inspect_ok(move |chunk| {
                sent += chunk.len() as u64;
                progress(sent);
            }))
        }
    }
}
