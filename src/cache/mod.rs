//! Cache Tier
//!
//! Local write-back cache keyed by asset id. Three places hold data:
//!
//! - the memory tier: clean assets up to the cacheable threshold, LRU evicted
//! - the dirty set: entries awaiting a remote commit, pinned and never evicted
//! - the disk spool: payloads too large for memory, plus committed spool
//!   files kept readable for a short settle window

pub mod memory;
pub mod spool;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::asset::{AssetId, AssetMeta, BodyStream, Payload, PayloadSource};
use crate::error::{StoreError, StoreResult};
use crate::settings::StoreSettings;

pub use memory::{CachedAsset, MemoryTier};
pub use spool::Spool;

/// A cache hit, in whichever form the entry is held
#[derive(Debug, Clone)]
pub enum CacheHit {
    Memory { meta: AssetMeta, bytes: Bytes },
    Disk { meta: AssetMeta, path: PathBuf },
}

/// Snapshot of capacity usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPressure {
    /// Memory held by dirty entries
    pub dirty_bytes: u64,
    /// Memory held by clean entries
    pub clean_bytes: u64,
    pub capacity: u64,
    /// Dirty entries alone fill the budget; nothing is evictable
    pub stalled: bool,
}

/// An entry awaiting commit
struct DirtyEntry {
    meta: AssetMeta,
    payload: Payload,
}

/// The write-back cache
pub struct CacheTier {
    settings: Arc<StoreSettings>,
    /// Clean memory tier, absent when caching is disabled
    memory: Option<MemoryTier>,
    /// Pinned dirty entries
    dirty: RwLock<HashMap<AssetId, DirtyEntry>>,
    /// Memory held by dirty entries
    dirty_bytes: AtomicU64,
    /// Disk spool, absent when the spool directory is unusable
    spool: Option<Spool>,
    /// Set after a local I/O failure; the facade commits synchronously instead
    bypass: AtomicBool,
    /// Committed spool files kept readable until the settle window passes
    settled: Cache<AssetId, AssetMeta>,
    /// Per-id writer locks
    locks: Mutex<HashMap<AssetId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheTier {
    /// Build the tier from settings. A spool directory that cannot be opened
    /// puts the tier in bypass mode instead of failing.
    pub fn new(settings: Arc<StoreSettings>) -> Self {
        let memory = settings
            .cache_enabled
            .then(|| MemoryTier::new(settings.cache_capacity_bytes));

        let spool_dir = settings.spool_dir();
        let spool = match Spool::open(spool_dir.clone()) {
            Ok(spool) => Some(spool),
            Err(e) => {
                warn!(
                    spool_dir = %spool_dir.display(),
                    error = %e,
                    "Spool unavailable, cache tier running in bypass mode"
                );
                None
            }
        };
        let bypass = AtomicBool::new(spool.is_none());

        let listener_dir = spool_dir;
        let settled = Cache::builder()
            .time_to_live(settings.settle_window().max(Duration::from_millis(1)))
            .name("settled_spool_files")
            .eviction_listener(move |id: Arc<AssetId>, _meta: AssetMeta, cause: RemovalCause| {
                if cause != RemovalCause::Replaced {
                    remove_spool_files(&listener_dir, &id);
                }
            })
            .build();

        info!(
            cache_enabled = settings.cache_enabled,
            capacity_mb = settings.cache_capacity_bytes / (1024 * 1024),
            cacheable_size = settings.cacheable_size_threshold,
            "Cache tier initialized"
        );

        Self {
            settings,
            memory,
            dirty: RwLock::new(HashMap::new()),
            dirty_bytes: AtomicU64::new(0),
            spool,
            bypass,
            settled,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an asset in any local location
    pub fn get(&self, id: &AssetId) -> Option<CacheHit> {
        {
            let dirty = self.dirty.read().expect("dirty set lock poisoned");
            if let Some(entry) = dirty.get(id) {
                debug!(asset = %id, "Cache HIT (dirty)");
                return Some(match &entry.payload.source {
                    PayloadSource::Memory(bytes) => CacheHit::Memory {
                        meta: entry.meta.clone(),
                        bytes: bytes.clone(),
                    },
                    PayloadSource::Disk(path) => CacheHit::Disk {
                        meta: entry.meta.clone(),
                        path: path.clone(),
                    },
                });
            }
        }

        if let Some(meta) = self.settled.get(id) {
            if let Some(spool) = &self.spool {
                let path = spool.data_path(id);
                if path.exists() {
                    debug!(asset = %id, "Cache HIT (settling spool file)");
                    return Some(CacheHit::Disk { meta, path });
                }
            }
        }

        let memory = self.memory.as_ref()?;
        memory.get(id).map(|cached| CacheHit::Memory {
            meta: cached.meta.clone(),
            bytes: cached.bytes.clone(),
        })
    }

    /// Metadata of a locally known asset, without touching recency
    pub fn meta(&self, id: &AssetId) -> Option<AssetMeta> {
        if let Some(entry) = self.dirty.read().expect("dirty set lock poisoned").get(id) {
            return Some(entry.meta.clone());
        }
        if let Some(meta) = self.settled.get(id) {
            return Some(meta);
        }
        self.memory
            .as_ref()
            .and_then(|m| m.peek(id))
            .map(|cached| cached.meta.clone())
    }

    /// Cache a committed asset. Returns false when the asset is not eligible
    /// for the memory tier (too large, caching disabled, or no room left
    /// beside the dirty entries).
    pub fn put_clean(&self, meta: AssetMeta, bytes: Bytes) -> bool {
        let Some(memory) = &self.memory else {
            return false;
        };
        if meta.size > self.settings.cacheable_size_threshold {
            debug!(asset = %meta.id, size = meta.size, "Asset too large for memory tier");
            return false;
        }
        let dirty_bytes = self.dirty_bytes.load(Ordering::Relaxed);
        if dirty_bytes + meta.size > self.settings.cache_capacity_bytes {
            debug!(asset = %meta.id, size = meta.size, dirty_bytes = dirty_bytes, "No room beside dirty entries");
            return false;
        }
        memory.insert(meta, bytes);
        self.enforce_budget();
        true
    }

    /// Shrink the clean tier so clean and dirty bytes together fit the capacity
    fn enforce_budget(&self) {
        let Some(memory) = &self.memory else {
            return;
        };
        let dirty_bytes = self.dirty_bytes.load(Ordering::Relaxed);
        if dirty_bytes == 0 {
            return;
        }
        let budget = self.settings.cache_capacity_bytes.saturating_sub(dirty_bytes);
        let evicted = memory.shrink_to(budget);
        if evicted > 0 {
            debug!(evicted = evicted, dirty_bytes = dirty_bytes, "Evicted clean entries for dirty data");
        }
    }

    /// Pin an entry as dirty until its commit succeeds or is abandoned.
    ///
    /// In-memory payloads above the cacheable threshold are moved to the
    /// spool first. Returns the payload the commit should read from.
    pub fn pin_dirty(&self, meta: AssetMeta, payload: Payload) -> StoreResult<Payload> {
        let payload = match &payload.source {
            PayloadSource::Memory(bytes) if payload.size > self.settings.cacheable_size_threshold => {
                let path = self.spool_bytes(&meta, bytes)?;
                Payload {
                    source: PayloadSource::Disk(path),
                    size: payload.size,
                    sha1: payload.sha1.clone(),
                }
            }
            _ => payload,
        };

        let memory_bytes = if payload.is_in_memory() { payload.size } else { 0 };
        let id = meta.id.clone();
        let entry = DirtyEntry {
            meta,
            payload: payload.clone(),
        };

        let previous = self
            .dirty
            .write()
            .expect("dirty set lock poisoned")
            .insert(id.clone(), entry);
        if let Some(prev) = previous {
            if prev.payload.is_in_memory() {
                self.dirty_bytes.fetch_sub(prev.payload.size, Ordering::Relaxed);
            }
        }
        self.dirty_bytes.fetch_add(memory_bytes, Ordering::Relaxed);

        debug!(asset = %id, size = payload.size, on_disk = !payload.is_in_memory(), "Pinned dirty entry");
        self.enforce_budget();
        self.check_pressure();
        Ok(payload)
    }

    /// Copy a stream into the spool, returning a re-openable payload.
    /// `meta.sha1` is computed while streaming.
    pub async fn spool_stream(&self, meta: &mut AssetMeta, stream: BodyStream) -> StoreResult<Payload> {
        let spool = self.usable_spool()?;
        match spool.write_stream(meta, stream).await {
            Ok(path) => Ok(Payload {
                source: PayloadSource::Disk(path),
                size: meta.size,
                sha1: meta.sha1.clone(),
            }),
            Err(e) => Err(self.spool_failure(e)),
        }
    }

    fn spool_bytes(&self, meta: &AssetMeta, bytes: &Bytes) -> StoreResult<PathBuf> {
        let spool = self.usable_spool()?;
        spool.write_bytes(meta, bytes).map_err(|e| self.spool_failure(e))
    }

    fn usable_spool(&self) -> StoreResult<&Spool> {
        match &self.spool {
            Some(spool) if !self.is_bypassed() => Ok(spool),
            _ => Err(StoreError::CacheIo("spool unavailable (bypass mode)".to_string())),
        }
    }

    /// Classify a spool error; local I/O failures switch the tier to bypass mode
    fn spool_failure(&self, e: anyhow::Error) -> StoreError {
        match e.downcast::<StoreError>() {
            Ok(store_err) => store_err,
            Err(e) => {
                if !self.bypass.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Local cache I/O failed, switching to bypass mode");
                }
                StoreError::CacheIo(e.to_string())
            }
        }
    }

    /// Record a successful commit: unpin and keep the data as a clean entry
    pub fn mark_clean(&self, id: &AssetId) {
        let removed = self.dirty.write().expect("dirty set lock poisoned").remove(id);
        let Some(entry) = removed else {
            return;
        };

        match entry.payload.source {
            PayloadSource::Memory(bytes) => {
                self.dirty_bytes.fetch_sub(entry.payload.size, Ordering::Relaxed);
                self.put_clean(entry.meta, bytes);
            }
            PayloadSource::Disk(_) => self.settle(entry.meta),
        }
        debug!(asset = %id, "Marked entry clean");
    }

    /// Keep a committed spool file readable for the settle window, then delete it.
    /// The sidecar goes at once so a restart never takes the file for a dirty entry.
    pub fn settle(&self, meta: AssetMeta) {
        let Some(spool) = &self.spool else {
            return;
        };
        if self.settings.settle_window_ms == 0 {
            spool.remove(&meta.id);
            return;
        }
        spool.remove_meta(&meta.id);
        self.settled.insert(meta.id.clone(), meta);
    }

    /// Delete a spooled payload that never became a dirty entry
    pub fn discard_spooled(&self, id: &AssetId) {
        if self.is_dirty(id) {
            return;
        }
        if let Some(spool) = &self.spool {
            spool.remove(id);
        }
    }

    /// Drop a dirty entry without committing it
    pub fn abandon(&self, id: &AssetId) -> bool {
        let removed = self.dirty.write().expect("dirty set lock poisoned").remove(id);
        match removed {
            Some(entry) => {
                match entry.payload.source {
                    PayloadSource::Memory(_) => {
                        self.dirty_bytes.fetch_sub(entry.payload.size, Ordering::Relaxed);
                    }
                    PayloadSource::Disk(_) => {
                        if let Some(spool) = &self.spool {
                            spool.remove(id);
                        }
                    }
                }
                warn!(asset = %id, size = entry.meta.size, "Abandoned dirty entry; remote copy was never confirmed");
                true
            }
            None => false,
        }
    }

    pub fn is_dirty(&self, id: &AssetId) -> bool {
        self.dirty.read().expect("dirty set lock poisoned").contains_key(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.read().expect("dirty set lock poisoned").len()
    }

    /// Current capacity usage
    pub fn pressure(&self) -> CapacityPressure {
        let dirty_bytes = self.dirty_bytes.load(Ordering::Relaxed);
        let clean_bytes = self.memory.as_ref().map_or(0, |m| m.weighted_size());
        let capacity = self.settings.cache_capacity_bytes;
        CapacityPressure {
            dirty_bytes,
            clean_bytes,
            capacity,
            stalled: dirty_bytes >= capacity,
        }
    }

    /// Warn when dirty entries alone hold the whole budget
    pub fn check_pressure(&self) -> CapacityPressure {
        let pressure = self.pressure();
        if pressure.stalled {
            warn!(
                dirty_bytes = pressure.dirty_bytes,
                capacity = pressure.capacity,
                dirty_entries = self.dirty_count(),
                "Cache capacity held entirely by dirty entries; eviction stalled until commits complete"
            );
        }
        pressure
    }

    /// Serialize writers of one id
    pub async fn lock_id(&self, id: &AssetId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("id lock table poisoned");
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Background maintenance: deferred evictions, settle expiry, idle locks
    pub fn maintain(&self) {
        if let Some(memory) = &self.memory {
            memory.run_pending_tasks();
            memory.log_metrics();
        }
        self.enforce_budget();
        self.settled.run_pending_tasks();

        {
            let mut locks = self.locks.lock().expect("id lock table poisoned");
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        self.check_pressure();
    }

    /// Reinstate spooled dirty entries from a previous run
    pub fn recover(&self) -> Vec<(AssetMeta, Payload)> {
        let Some(spool) = &self.spool else {
            return Vec::new();
        };

        let found = match spool.recover() {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Spool recovery failed");
                return Vec::new();
            }
        };

        let mut recovered = Vec::with_capacity(found.len());
        for (meta, path) in found {
            let payload = Payload {
                source: PayloadSource::Disk(path),
                size: meta.size,
                sha1: meta.sha1.clone(),
            };
            let entry = DirtyEntry {
                meta: meta.clone(),
                payload: payload.clone(),
            };
            self.dirty
                .write()
                .expect("dirty set lock poisoned")
                .insert(meta.id.clone(), entry);
            recovered.push((meta, payload));
        }
        recovered
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    pub fn memory(&self) -> Option<&MemoryTier> {
        self.memory.as_ref()
    }
}

fn remove_spool_files(dir: &std::path::Path, id: &AssetId) {
    for name in [format!("{}.asset", id), format!("{}.meta.json", id)] {
        let path = dir.join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove settled spool file");
            }
        }
    }
}
