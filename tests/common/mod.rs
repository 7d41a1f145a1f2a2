//! Shared fixtures: an in-memory object store behind the `Transport`
//! capability and an in-memory legacy backend.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::Method;

use tiered_assets::asset::chunk_bytes;
use tiered_assets::remote::connector::HEADER_SHA1;
use tiered_assets::remote::RequestBody;
use tiered_assets::{
    AssetId, LegacyAsset, LegacyBackend, StoreError, StoreResult, StoreSettings, Transport, TransportRequest,
    TransportResponse,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings pointing at the fake backend with a private spool directory
pub fn settings(spool: &std::path::Path, tweak: impl FnOnce(&mut StoreSettings)) -> Arc<StoreSettings> {
    let mut settings = StoreSettings {
        remote_url: Some("http://objects.test/v1".to_string()),
        spool_dir: Some(spool.to_path_buf()),
        worker_count: 2,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 5,
        protocol_retry_pause_ms: 1,
        shutdown_grace_ms: 500,
        settle_window_ms: 0,
        ..Default::default()
    };
    tweak(&mut settings);
    Arc::new(settings)
}

/// What the fake saw for one upload
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub url: String,
    pub streamed: bool,
    pub allow_write_buffering: bool,
    pub max_chunk: usize,
    pub bytes: usize,
    pub declared_length: Option<u64>,
}

/// One stored object; `sha1` is the metadata header sent with the upload
#[derive(Clone)]
struct StoredObject {
    content_type: String,
    data: Bytes,
    sha1: Option<String>,
}

/// In-memory object store speaking the remote protocol
#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    /// Errors returned (in order) before any request is processed
    script: Mutex<VecDeque<StoreError>>,
    /// Returned for every upload while set
    persistent_put_error: Mutex<Option<StoreError>>,
    put_delay: Mutex<Duration>,
    pub puts: Mutex<Vec<PutRecord>>,
    pub put_attempts: AtomicUsize,
    pub gets: AtomicUsize,
}

impl FakeObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, error: StoreError) {
        self.script.lock().unwrap().push_back(error);
    }

    pub fn fail_puts_with(&self, error: Option<StoreError>) {
        *self.persistent_put_error.lock().unwrap() = error;
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    /// Seed an object as if another client had uploaded it without
    /// metadata headers
    pub fn insert(&self, url: &str, content_type: &str, data: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(
            url.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                data: data.into(),
                sha1: None,
            },
        );
    }

    pub fn object(&self, url: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(url).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn completed_puts(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    fn respond(status: u16, headers: HeaderMap, body: Bytes) -> StoreResult<TransportResponse> {
        Ok(TransportResponse {
            status,
            headers,
            body: chunk_bytes(body, 8 * 1024),
        })
    }

    async fn put(&self, request: TransportRequest) -> StoreResult<TransportResponse> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let persistent = self.persistent_put_error.lock().unwrap().clone();
        if let Some(error) = persistent {
            return Err(error);
        }

        let declared_length = request
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let protect = request.headers.contains_key(IF_NONE_MATCH);
        let sha1 = request
            .headers
            .get(HEADER_SHA1)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let streamed = request.body.is_streamed();
        let (data, max_chunk) = match request.body {
            RequestBody::Empty => (Bytes::new(), 0),
            RequestBody::Buffered(bytes) => {
                let len = bytes.len();
                (bytes, len)
            }
            RequestBody::Streamed { stream, .. } => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                let max_chunk = chunks.iter().map(|c| c.len()).max().unwrap_or(0);
                (Bytes::from(chunks.concat()), max_chunk)
            }
        };

        self.puts.lock().unwrap().push(PutRecord {
            url: request.url.clone(),
            streamed,
            allow_write_buffering: request.allow_write_buffering,
            max_chunk,
            bytes: data.len(),
            declared_length,
        });

        let mut objects = self.objects.lock().unwrap();
        if protect && objects.contains_key(&request.url) {
            return Self::respond(412, HeaderMap::new(), Bytes::from_static(b"exists"));
        }
        objects.insert(
            request.url,
            StoredObject {
                content_type,
                data,
                sha1,
            },
        );
        Self::respond(201, HeaderMap::new(), Bytes::new())
    }

    fn get(&self, request: TransportRequest) -> StoreResult<TransportResponse> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let found = self.objects.lock().unwrap().get(&request.url).cloned();
        match found {
            Some(object) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_str(&object.content_type).unwrap());
                headers.insert(CONTENT_LENGTH, HeaderValue::from(object.data.len() as u64));
                if let Some(sha1) = &object.sha1 {
                    headers.insert(HeaderName::from_static(HEADER_SHA1), HeaderValue::from_str(sha1).unwrap());
                }
                Self::respond(200, headers, object.data)
            }
            None => Self::respond(404, HeaderMap::new(), Bytes::from_static(b"no such object")),
        }
    }
}

#[async_trait]
impl Transport for FakeObjectStore {
    async fn execute(&self, request: TransportRequest) -> StoreResult<TransportResponse> {
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            if request.method == Method::PUT {
                self.put_attempts.fetch_add(1, Ordering::SeqCst);
            }
            return Err(error);
        }

        match request.method {
            Method::PUT => self.put(request).await,
            Method::GET => self.get(request),
            _ => Self::respond(405, HeaderMap::new(), Bytes::new()),
        }
    }
}

/// Legacy backend holding a fixed set of assets
#[derive(Default)]
pub struct FakeLegacy {
    assets: Mutex<HashMap<AssetId, LegacyAsset>>,
    pub lookups: AtomicUsize,
}

impl FakeLegacy {
    pub fn with(id: &AssetId, data: &'static [u8]) -> Arc<Self> {
        let legacy = Self::default();
        legacy.assets.lock().unwrap().insert(
            id.clone(),
            LegacyAsset {
                content_type: "image/jp2".to_string(),
                data: Bytes::from_static(data),
            },
        );
        Arc::new(legacy)
    }
}

#[async_trait]
impl LegacyBackend for FakeLegacy {
    async fn fetch_legacy(&self, id: &AssetId) -> StoreResult<Option<LegacyAsset>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.assets.lock().unwrap().get(id).cloned())
    }
}

/// Poll until `check` holds or a couple of seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
