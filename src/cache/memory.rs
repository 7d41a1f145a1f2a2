//! In-memory clean tier
//!
//! Byte-weighted LRU cache for small, already-committed assets, built on Moka.
//! Only clean entries live here; dirty entries are pinned elsewhere so that
//! Moka's eviction can never pick them. Moka bounds the tier to the full
//! capacity; `shrink_to` gives memory back when dirty entries need it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, trace};

use crate::asset::{AssetId, AssetMeta};

/// A clean asset held in memory
#[derive(Debug)]
pub struct CachedAsset {
    pub meta: AssetMeta,
    pub bytes: Bytes,
    /// Tick of the last read or insert
    last_access: AtomicU64,
}

/// LRU tier for clean assets with hit/miss accounting
pub struct MemoryTier {
    entries: Cache<AssetId, Arc<CachedAsset>>,
    /// Logical clock ordering accesses for `shrink_to`
    clock: AtomicU64,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl MemoryTier {
    /// Create a tier bounded to `capacity_bytes` of asset data
    pub fn new(capacity_bytes: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_id: &AssetId, asset: &Arc<CachedAsset>| -> u32 {
                asset.bytes.len().try_into().unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .name("clean_asset_cache")
            .build();

        Self {
            entries,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a clean asset. Updates recency and hit/miss counters.
    pub fn get(&self, id: &AssetId) -> Option<Arc<CachedAsset>> {
        match self.entries.get(id) {
            Some(asset) => {
                asset.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(asset = %id, "Memory tier HIT");
                Some(asset)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(asset = %id, "Memory tier MISS");
                None
            }
        }
    }

    /// Look up without counting a hit or refreshing recency
    pub fn peek(&self, id: &AssetId) -> Option<Arc<CachedAsset>> {
        self.entries.get(id)
    }

    /// Insert a clean asset
    pub fn insert(&self, meta: AssetMeta, bytes: Bytes) {
        let id = meta.id.clone();
        let size = bytes.len();
        let asset = CachedAsset {
            meta,
            bytes,
            last_access: AtomicU64::new(self.tick()),
        };
        self.entries.insert(id.clone(), Arc::new(asset));
        debug!(asset = %id, size = size, "Cached clean asset");
    }

    /// Evict least recently used entries until at most `budget` bytes remain.
    /// Returns the number of bytes evicted.
    pub fn shrink_to(&self, budget: u64) -> u64 {
        self.entries.run_pending_tasks();
        let mut held = self.weighted_size();
        if held <= budget {
            return 0;
        }

        let mut candidates: Vec<(u64, Arc<AssetId>, u64)> = self
            .entries
            .iter()
            .map(|(id, asset)| (asset.last_access.load(Ordering::Relaxed), id, asset.bytes.len() as u64))
            .collect();
        candidates.sort_by_key(|(tick, _, _)| *tick);

        let mut evicted = 0;
        for (_, id, size) in candidates {
            if held <= budget {
                break;
            }
            self.entries.invalidate(id.as_ref());
            held = held.saturating_sub(size);
            evicted += size;
            trace!(asset = %id, size = size, "Evicted clean asset to make room for dirty entries");
        }
        self.entries.run_pending_tasks();
        evicted
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Run Moka's deferred housekeeping (evictions, recency bookkeeping)
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    /// Bytes currently held
    pub fn weighted_size(&self) -> u64 {
        self.entries.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();

        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            entries = self.entry_count(),
            bytes = self.weighted_size(),
            "Memory tier metrics"
        );
    }
}
