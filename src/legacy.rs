//! Legacy Fallback Connector
//!
//! Read-only access to the superseded asset backend, consulted only when the
//! remote store misses and `legacy_read` is enabled.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use tracing::{debug, warn};

use crate::asset::{AssetBody, AssetId, AssetMeta};
use crate::error::{StoreError, StoreResult};
use crate::remote::{Transport, TransportRequest};
use crate::settings::StoreSettings;

/// An asset found in the legacy backend
#[derive(Debug, Clone)]
pub struct LegacyAsset {
    pub content_type: String,
    pub data: Bytes,
}

/// Read-only key to bytes lookup
#[async_trait]
pub trait LegacyBackend: Send + Sync {
    /// `Ok(None)` is a miss
    async fn fetch_legacy(&self, id: &AssetId) -> StoreResult<Option<LegacyAsset>>;
}

/// Legacy backend reached over HTTP at `<legacy_url>/assets/<id>`
pub struct HttpLegacyBackend {
    transport: Arc<dyn Transport>,
    settings: Arc<StoreSettings>,
    base_url: String,
}

impl HttpLegacyBackend {
    pub fn new(settings: Arc<StoreSettings>, transport: Arc<dyn Transport>) -> StoreResult<Self> {
        let base_url = settings
            .legacy_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| StoreError::Configuration("legacy_read requires the legacy_url setting".to_string()))?;

        Ok(Self {
            transport,
            settings,
            base_url,
        })
    }

    fn asset_url(&self, id: &AssetId) -> String {
        format!("{}/assets/{}", self.base_url, urlencoding::encode(id.as_str()))
    }
}

#[async_trait]
impl LegacyBackend for HttpLegacyBackend {
    async fn fetch_legacy(&self, id: &AssetId) -> StoreResult<Option<LegacyAsset>> {
        let started = Instant::now();
        let request = TransportRequest::new(Method::GET, self.asset_url(id), self.settings.read_timeout());

        let response = self.transport.execute(request).await?;
        if response.status == 404 {
            debug!(asset = %id, "Legacy backend MISS");
            return Ok(None);
        }
        if !response.is_success() {
            let status = response.status;
            let body = response.text().await;
            return Err(StoreError::from_status(status, &body));
        }

        let content_type = response
            .headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = AssetBody::Stream(response.body).collect().await?;

        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_operation() {
            warn!(asset = %id, elapsed_ms = elapsed.as_millis() as u64, "Slow legacy fetch");
        }
        debug!(asset = %id, size = data.len(), "Legacy backend HIT");

        Ok(Some(LegacyAsset { content_type, data }))
    }
}

impl LegacyAsset {
    /// Metadata for re-homing this asset in the remote store
    pub fn meta(&self, id: &AssetId, created_at: u64) -> AssetMeta {
        AssetMeta {
            id: id.clone(),
            content_type: self.content_type.clone(),
            size: self.data.len() as u64,
            created_at,
            sha1: crate::asset::sha1_hex(&self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::chunk_bytes;
    use crate::remote::TransportResponse;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use std::sync::Mutex;

    struct OneShot {
        status: u16,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for OneShot {
        async fn execute(&self, request: TransportRequest) -> StoreResult<TransportResponse> {
            self.urls.lock().unwrap().push(request.url);
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/jp2"));
            Ok(TransportResponse {
                status: self.status,
                headers,
                body: chunk_bytes(Bytes::from_static(b"legacy bytes"), 5),
            })
        }
    }

    fn backend(status: u16) -> (HttpLegacyBackend, Arc<OneShot>) {
        let transport = Arc::new(OneShot {
            status,
            urls: Mutex::new(Vec::new()),
        });
        let settings = Arc::new(StoreSettings {
            legacy_url: Some("http://legacy.test/".to_string()),
            ..Default::default()
        });
        (HttpLegacyBackend::new(settings, transport.clone()).unwrap(), transport)
    }

    #[tokio::test]
    async fn test_hit() {
        let (legacy, transport) = backend(200);
        let id = AssetId::new("abc-123").unwrap();

        let asset = legacy.fetch_legacy(&id).await.unwrap().unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"legacy bytes"));
        assert_eq!(asset.content_type, "image/jp2");
        assert_eq!(transport.urls.lock().unwrap()[0], "http://legacy.test/assets/abc-123");
        assert_eq!(asset.meta(&id, 0).size, 12);
    }

    #[tokio::test]
    async fn test_miss_and_error() {
        let (legacy, _) = backend(404);
        assert!(legacy.fetch_legacy(&AssetId::new("x").unwrap()).await.unwrap().is_none());

        let (legacy, _) = backend(503);
        let err = legacy.fetch_legacy(&AssetId::new("x").unwrap()).await.unwrap_err();
        assert!(matches!(err, StoreError::Server(503, _)));
    }

    #[test]
    fn test_requires_url() {
        let transport = Arc::new(OneShot {
            status: 200,
            urls: Mutex::new(Vec::new()),
        });
        let err = HttpLegacyBackend::new(Arc::new(StoreSettings::default()), transport).err();
        assert!(matches!(err, Some(StoreError::Configuration(_))));
    }
}
