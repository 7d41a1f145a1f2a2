//! Store Facade
//!
//! Entry point of the engine. Every store goes through the cache tier; the
//! mode settings decide whether the remote commit happens on the caller's
//! path or on the commit queue:
//!
//! | `write_back` | `async_store` | behaviour                                         |
//! |--------------|---------------|---------------------------------------------------|
//! | false        | false         | commit, then cache clean; errors surface          |
//! | true         | true          | pin dirty, enqueue, return `Queued`               |
//! | true         | false         | pin dirty, commit; transient failure → `Deferred` |
//!
//! Fetches look in the cache, then the remote store, then the legacy
//! backend when `legacy_read` is enabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::asset::{
    digest_stream, from_unix_millis, limit_stream, sha1_hex, to_unix_millis, AssetBody, AssetId, AssetMeta, AssetRecord,
    BodyStream, Payload, PayloadSource,
};
use crate::cache::{CacheHit, CacheTier};
use crate::commit::{CommitQueue, CommitTask, ExponentialBackoff, FailureHook, RetryPolicy, ShutdownReport};
use crate::error::{StoreError, StoreResult};
use crate::legacy::{HttpLegacyBackend, LegacyBackend};
use crate::remote::{HttpTransport, RemoteObject, RemoteStore, Transport, UploadOptions};
use crate::settings::StoreSettings;
use crate::stats::{StatsSnapshot, StoreStats};

/// How a store request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Durable in the remote store on return
    Committed,
    /// Accepted; the commit queue will persist it
    Queued,
    /// The synchronous commit failed transiently; the entry stays pinned
    /// and the commit queue took over
    Deferred,
    /// The same bytes were already stored under this id
    AlreadyStored,
}

impl StoreOutcome {
    /// Whether the remote copy is confirmed
    pub fn is_durable(&self) -> bool {
        matches!(self, StoreOutcome::Committed | StoreOutcome::AlreadyStored)
    }
}

/// Body ready for commit
enum Prepared {
    /// Re-openable, so commits can be retried
    Payload(Payload),
    /// A stream that could not be spooled; one upload attempt only
    OneShot(BodyStream),
}

/// Assembles an [`AssetStore`] with optional substitute backends
pub struct AssetStoreBuilder {
    settings: Arc<StoreSettings>,
    transport: Option<Arc<dyn Transport>>,
    legacy: Option<Arc<dyn LegacyBackend>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    failure_hook: Option<FailureHook>,
}

impl AssetStoreBuilder {
    /// Transport for the remote store (and the HTTP legacy backend)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Legacy backend; only consulted when `legacy_read` is set
    pub fn legacy_backend(mut self, legacy: Arc<dyn LegacyBackend>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Called for every commit that ends in `Failed`
    pub fn on_commit_failure(mut self, hook: FailureHook) -> Self {
        self.failure_hook = Some(hook);
        self
    }

    /// Validate the settings and wire the tiers together
    pub fn build(self) -> StoreResult<AssetStore> {
        let settings = self.settings;
        settings.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };

        let legacy = if settings.legacy_read {
            Some(match self.legacy {
                Some(legacy) => legacy,
                None => Arc::new(HttpLegacyBackend::new(settings.clone(), transport.clone())?) as Arc<dyn LegacyBackend>,
            })
        } else {
            None
        };

        let cache = Arc::new(CacheTier::new(settings.clone()));
        let remote = Arc::new(RemoteStore::new(settings.clone(), transport)?);
        let policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_settings(&settings)) as Arc<dyn RetryPolicy>);
        let queue = Arc::new(CommitQueue::new(
            settings.clone(),
            cache.clone(),
            remote.clone(),
            policy,
            self.failure_hook,
        ));

        info!(
            write_back = settings.write_back,
            async_store = settings.async_store,
            legacy_read = settings.legacy_read,
            cache_enabled = settings.cache_enabled,
            overwrite_protection = settings.overwrite_protection,
            workers = settings.worker_count,
            "Asset store configured"
        );

        Ok(AssetStore {
            settings,
            cache,
            remote,
            legacy,
            queue,
            stats: Arc::new(StoreStats::default()),
            maintenance: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

/// The tiered asset store
pub struct AssetStore {
    settings: Arc<StoreSettings>,
    cache: Arc<CacheTier>,
    remote: Arc<RemoteStore>,
    legacy: Option<Arc<dyn LegacyBackend>>,
    queue: Arc<CommitQueue>,
    stats: Arc<StoreStats>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AssetStore {
    /// Store backed by HTTP transports built from `settings`
    pub fn new(settings: Arc<StoreSettings>) -> StoreResult<Self> {
        Self::builder(settings).build()
    }

    pub fn builder(settings: Arc<StoreSettings>) -> AssetStoreBuilder {
        AssetStoreBuilder {
            settings,
            transport: None,
            legacy: None,
            retry_policy: None,
            failure_hook: None,
        }
    }

    /// Start commit workers, recover spooled dirty entries from a previous
    /// run and schedule cache maintenance. Returns the number of recovered
    /// entries. Must run inside a tokio runtime.
    pub async fn start(&self) -> StoreResult<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        self.queue.start();
        self.spawn_maintenance();

        let recovered = self.cache.recover();
        let count = recovered.len();
        for (meta, payload) in recovered {
            info!(asset = %meta.id, size = meta.size, "Re-enqueueing recovered dirty entry");
            self.queue.enqueue_wait(CommitTask::new(meta, payload)).await?;
        }

        info!(recovered = count, "Asset store started");
        Ok(count)
    }

    fn spawn_maintenance(&self) {
        let mut slot = self.maintenance.lock().expect("maintenance slot poisoned");
        if slot.is_some() {
            return;
        }

        let cache = self.cache.clone();
        let period = self.settings.maintenance_interval().max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.maintain();
            }
        }));
    }

    /// Drain the commit queue for the grace period and stop background work
    pub async fn shutdown(&self) -> ShutdownReport {
        let maintenance = self.maintenance.lock().expect("maintenance slot poisoned").take();
        if let Some(handle) = maintenance {
            handle.abort();
        }

        let report = self.queue.shutdown().await;
        self.cache.maintain();

        let dirty = self.cache.dirty_count();
        if dirty > 0 {
            warn!(dirty_entries = dirty, "Dirty entries remain at shutdown; spooled ones are recovered on next start");
        }
        report
    }

    /// Wait until every queued commit reached a terminal state
    pub async fn flush(&self) {
        self.queue.drain().await;
    }

    /// Persist an asset. Storing the same bytes under an id again is a
    /// no-op; different bytes fail with `ImmutableViolation`.
    pub async fn store(&self, record: AssetRecord) -> StoreResult<StoreOutcome> {
        StoreStats::incr(&self.stats.puts);
        let id = record.id.clone();

        let result = self.store_inner(record).await;
        match &result {
            Ok(StoreOutcome::AlreadyStored) => StoreStats::incr(&self.stats.already_stored),
            Ok(StoreOutcome::Deferred) => StoreStats::incr(&self.stats.deferred),
            Ok(outcome) => debug!(asset = %id, outcome = ?outcome, "Stored asset"),
            Err(e) => {
                if matches!(e, StoreError::Timeout) {
                    StoreStats::incr(&self.stats.timeouts);
                }
                StoreStats::incr(&self.stats.failures);
                warn!(asset = %id, error = %e, "Store failed");
            }
        }
        result
    }

    async fn store_inner(&self, record: AssetRecord) -> StoreResult<StoreOutcome> {
        let AssetRecord {
            id,
            content_type,
            size,
            created_at,
            body,
        } = record;

        if let AssetBody::Bytes(bytes) = &body {
            if bytes.len() as u64 != size {
                return Err(StoreError::InvalidAsset(format!(
                    "asset {} declared {} bytes but carries {}",
                    id,
                    size,
                    bytes.len()
                )));
            }
        }

        // Writers of one id serialize here; a later writer sees the earlier
        // entry and resolves as a duplicate.
        let _guard = self.cache.lock_id(&id).await;

        if let Some(existing) = self.cache.meta(&id) {
            return self.check_duplicate(&existing, body).await;
        }

        let mut meta = AssetMeta {
            id,
            content_type,
            size,
            created_at: to_unix_millis(created_at),
            sha1: String::new(),
        };
        if size > self.settings.cacheable_size_threshold {
            StoreStats::incr(&self.stats.big_asset_bypasses);
        }

        let prepared = self.prepare(&mut meta, body).await?;
        let write_back = self.settings.write_back && !self.cache.is_bypassed();

        match prepared {
            Prepared::Payload(payload) if write_back => self.write_back(meta, payload).await,
            prepared => self.write_through(meta, prepared).await,
        }
    }

    async fn check_duplicate(&self, existing: &AssetMeta, body: AssetBody) -> StoreResult<StoreOutcome> {
        let (size, sha1) = match body {
            AssetBody::Bytes(bytes) => (bytes.len() as u64, sha1_hex(&bytes)),
            AssetBody::Stream(stream) => digest_stream(limit_stream(stream, existing.size + 1)).await?,
        };

        if size == existing.size && sha1 == existing.sha1 {
            debug!(asset = %existing.id, "Asset already stored with identical content");
            Ok(StoreOutcome::AlreadyStored)
        } else {
            warn!(asset = %existing.id, "Rejected store of different content under an existing id");
            Err(StoreError::ImmutableViolation(existing.id.to_string()))
        }
    }

    /// Turn the body into something a commit can replay. Streams above the
    /// streaming threshold go to the spool and are never buffered whole.
    async fn prepare(&self, meta: &mut AssetMeta, body: AssetBody) -> StoreResult<Prepared> {
        let buffered = match body {
            AssetBody::Bytes(bytes) => bytes,
            AssetBody::Stream(stream) if meta.size <= self.settings.streaming_threshold => {
                let bytes = AssetBody::Stream(limit_stream(stream, meta.size + 1)).collect().await?;
                if bytes.len() as u64 != meta.size {
                    return Err(StoreError::InvalidAsset(format!(
                        "asset {} declared {} bytes but the stream produced {}",
                        meta.id,
                        meta.size,
                        bytes.len()
                    )));
                }
                bytes
            }
            AssetBody::Stream(stream) if self.cache.is_bypassed() => {
                return Ok(Prepared::OneShot(stream));
            }
            AssetBody::Stream(stream) => {
                let payload = self.cache.spool_stream(meta, stream).await?;
                return Ok(Prepared::Payload(payload));
            }
        };

        let payload = Payload::from_bytes(buffered);
        meta.sha1 = payload.sha1.clone();
        Ok(Prepared::Payload(payload))
    }

    async fn write_through(&self, meta: AssetMeta, prepared: Prepared) -> StoreResult<StoreOutcome> {
        let options = UploadOptions::from_settings(&self.settings);

        match prepared {
            Prepared::Payload(payload) => match self.remote.store(&meta, &payload, &options).await {
                Ok(()) => {
                    self.cache_committed(meta, payload);
                    Ok(StoreOutcome::Committed)
                }
                Err(StoreError::AlreadyExists(_)) => match self.remote.confirm_existing(&meta).await {
                    Ok(()) => {
                        self.cache_committed(meta, payload);
                        Ok(StoreOutcome::AlreadyStored)
                    }
                    Err(e) => {
                        self.discard_prepared(&meta.id, &payload);
                        Err(e)
                    }
                },
                Err(e) => {
                    self.discard_prepared(&meta.id, &payload);
                    Err(e)
                }
            },
            // Unspooled streams carry no digest, so an existing remote copy
            // cannot be compared and the conflict surfaces as is
            Prepared::OneShot(stream) => self
                .remote
                .store_stream(&meta, stream, &options)
                .await
                .map(|()| StoreOutcome::Committed),
        }
    }

    fn discard_prepared(&self, id: &AssetId, payload: &Payload) {
        if !payload.is_in_memory() {
            self.cache.discard_spooled(id);
        }
    }

    /// Keep a committed payload as a clean cache entry where it fits
    fn cache_committed(&self, meta: AssetMeta, payload: Payload) {
        match payload.source {
            PayloadSource::Memory(bytes) => {
                if self.cache.put_clean(meta, bytes) {
                    StoreStats::incr(&self.stats.cached_puts);
                }
            }
            PayloadSource::Disk(_) => self.cache.settle(meta),
        }
    }

    async fn write_back(&self, meta: AssetMeta, payload: Payload) -> StoreResult<StoreOutcome> {
        let pinned = match self.cache.pin_dirty(meta.clone(), payload.clone()) {
            Ok(pinned) => pinned,
            Err(StoreError::CacheIo(e)) => {
                warn!(asset = %meta.id, error = %e, "Cannot pin dirty entry locally, committing synchronously");
                return self.write_through(meta, Prepared::Payload(payload)).await;
            }
            Err(e) => return Err(e),
        };
        if pinned.is_in_memory() {
            StoreStats::incr(&self.stats.cached_puts);
        }

        let task = CommitTask::new(meta.clone(), pinned.clone());

        if self.settings.async_store {
            return match self.queue.enqueue(task).await {
                Ok(()) => Ok(StoreOutcome::Queued),
                Err(e) => {
                    self.cache.abandon(&meta.id);
                    Err(e)
                }
            };
        }

        let options = UploadOptions::from_settings(&self.settings);
        let result = match self.remote.store(&meta, &pinned, &options).await {
            Err(StoreError::AlreadyExists(_)) => self
                .remote
                .confirm_existing(&meta)
                .await
                .map(|()| StoreOutcome::AlreadyStored),
            other => other.map(|()| StoreOutcome::Committed),
        };
        match result {
            Ok(outcome) => {
                self.cache.mark_clean(&meta.id);
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => {
                if matches!(e, StoreError::Timeout) {
                    StoreStats::incr(&self.stats.timeouts);
                }
                warn!(asset = %meta.id, error = %e, "Synchronous commit failed, deferring to the commit queue");
                match self.queue.enqueue_wait(task).await {
                    Ok(()) => Ok(StoreOutcome::Deferred),
                    Err(queue_err) => {
                        debug!(asset = %meta.id, error = %queue_err, "Commit queue refused deferred entry");
                        self.cache.abandon(&meta.id);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.cache.abandon(&meta.id);
                Err(e)
            }
        }
    }

    /// Read an asset from the first tier that has it
    pub async fn fetch(&self, id: &AssetId) -> StoreResult<AssetRecord> {
        StoreStats::incr(&self.stats.gets);

        if let Some(hit) = self.cache.get(id) {
            match self.record_from_hit(hit).await {
                Ok(record) => {
                    StoreStats::incr(&self.stats.cache_hits);
                    return Ok(record);
                }
                Err(e) => debug!(asset = %id, error = %e, "Cached copy unreadable, falling through"),
            }
        }

        match self.remote.fetch(id).await {
            Ok(object) => {
                StoreStats::incr(&self.stats.remote_fetches);
                self.record_from_remote(id, object).await
            }
            Err(e) if e.is_not_found() => self.fetch_legacy(id).await,
            Err(e) => {
                if matches!(e, StoreError::Timeout) {
                    StoreStats::incr(&self.stats.timeouts);
                }
                StoreStats::incr(&self.stats.failures);
                Err(e)
            }
        }
    }

    async fn record_from_hit(&self, hit: CacheHit) -> StoreResult<AssetRecord> {
        match hit {
            CacheHit::Memory { meta, bytes } => Ok(AssetRecord {
                id: meta.id,
                content_type: meta.content_type,
                size: meta.size,
                created_at: from_unix_millis(meta.created_at),
                body: AssetBody::Bytes(bytes),
            }),
            CacheHit::Disk { meta, path } => {
                let payload = Payload {
                    source: PayloadSource::Disk(path),
                    size: meta.size,
                    sha1: meta.sha1.clone(),
                };
                let stream = payload.open(self.settings.transfer_buffer_size, None).await?;
                Ok(AssetRecord {
                    id: meta.id,
                    content_type: meta.content_type,
                    size: meta.size,
                    created_at: from_unix_millis(meta.created_at),
                    body: AssetBody::Stream(stream),
                })
            }
        }
    }

    async fn record_from_remote(&self, id: &AssetId, object: RemoteObject) -> StoreResult<AssetRecord> {
        let created_at = object.created_at.map(from_unix_millis).unwrap_or_else(SystemTime::now);

        let buffer = match object.size {
            None => true,
            Some(size) => {
                size <= self.settings.streaming_threshold
                    || (self.settings.cache_enabled && size <= self.settings.cacheable_size_threshold)
            }
        };

        if !buffer {
            let size = object.size.unwrap_or_default();
            debug!(asset = %id, size = size, "Streaming remote asset to caller");
            return Ok(AssetRecord {
                id: id.clone(),
                content_type: object.content_type,
                size,
                created_at,
                body: AssetBody::Stream(object.body),
            });
        }

        let bytes = AssetBody::Stream(object.body).collect().await?;
        if let Some(expected) = object.size {
            if bytes.len() as u64 != expected {
                return Err(StoreError::Protocol(format!(
                    "asset {} body was {} bytes, expected {}",
                    id,
                    bytes.len(),
                    expected
                )));
            }
        }

        let meta = AssetMeta {
            id: id.clone(),
            content_type: object.content_type,
            size: bytes.len() as u64,
            created_at: to_unix_millis(created_at),
            sha1: sha1_hex(&bytes),
        };
        self.cache.put_clean(meta.clone(), bytes.clone());

        Ok(AssetRecord {
            id: meta.id,
            content_type: meta.content_type,
            size: meta.size,
            created_at,
            body: AssetBody::Bytes(bytes),
        })
    }

    async fn fetch_legacy(&self, id: &AssetId) -> StoreResult<AssetRecord> {
        let Some(legacy) = &self.legacy else {
            StoreStats::incr(&self.stats.not_found);
            return Err(StoreError::NotFound(id.to_string()));
        };

        let asset = match legacy.fetch_legacy(id).await {
            Ok(Some(asset)) => asset,
            Ok(None) => {
                StoreStats::incr(&self.stats.not_found);
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => {
                StoreStats::incr(&self.stats.failures);
                warn!(asset = %id, error = %e, "Legacy backend lookup failed");
                return Err(e);
            }
        };
        StoreStats::incr(&self.stats.legacy_hits);

        let created_at = SystemTime::now();
        let meta = asset.meta(id, to_unix_millis(created_at));
        self.cache.put_clean(meta.clone(), asset.data.clone());

        if self.settings.migrate_on_legacy_hit {
            self.spawn_migration(meta.clone(), asset.data.clone());
        }

        Ok(AssetRecord {
            id: meta.id,
            content_type: meta.content_type,
            size: meta.size,
            created_at,
            body: AssetBody::Bytes(asset.data),
        })
    }

    /// Copy a legacy asset into the remote store without holding up the fetch
    fn spawn_migration(&self, meta: AssetMeta, data: Bytes) {
        let remote = self.remote.clone();
        let stats = self.stats.clone();
        let options = UploadOptions::from_settings(&self.settings);

        tokio::spawn(async move {
            let payload = Payload::from_bytes(data);
            match remote.store(&meta, &payload, &options).await {
                Ok(()) => {
                    StoreStats::incr(&stats.migrations);
                    info!(asset = %meta.id, size = meta.size, "Migrated legacy asset to remote store");
                }
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(asset = %meta.id, "Remote copy already exists, migration skipped");
                }
                Err(e) => warn!(asset = %meta.id, error = %e, "Legacy migration failed"),
            }
        });
    }

    /// Assets are immutable; deletion is never supported
    pub fn delete(&self, id: &AssetId) -> StoreResult<()> {
        debug!(asset = %id, "Rejected delete of immutable asset");
        Err(StoreError::Unsupported("immutable assets cannot be deleted"))
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.queue_depth = self.queue.depth();
        snapshot.dirty_entries = self.cache.dirty_count();
        snapshot.cached_bytes = self.cache.memory().map_or(0, |m| m.weighted_size());
        snapshot.hit_rate = self.cache.memory().map_or(0.0, |m| m.stats().2);
        snapshot.remote_health = self.remote.health_status().to_string();
        snapshot.bypassed = self.cache.is_bypassed();
        snapshot
    }

    pub fn settings(&self) -> &Arc<StoreSettings> {
        &self.settings
    }

    pub fn cache(&self) -> &CacheTier {
        &self.cache
    }

    pub fn queue(&self) -> &CommitQueue {
        &self.queue
    }

    pub fn remote(&self) -> &RemoteStore {
        &self.remote
    }
}
