//! Operation counters for the store facade

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, updated lock-free on every operation
#[derive(Debug, Default)]
pub struct StoreStats {
    pub gets: AtomicU64,
    pub cache_hits: AtomicU64,
    pub remote_fetches: AtomicU64,
    pub legacy_hits: AtomicU64,
    pub not_found: AtomicU64,
    pub puts: AtomicU64,
    pub cached_puts: AtomicU64,
    pub already_stored: AtomicU64,
    pub timeouts: AtomicU64,
    pub deferred: AtomicU64,
    pub failures: AtomicU64,
    pub big_asset_bypasses: AtomicU64,
    pub migrations: AtomicU64,
}

impl StoreStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            gets: load(&self.gets),
            cache_hits: load(&self.cache_hits),
            remote_fetches: load(&self.remote_fetches),
            legacy_hits: load(&self.legacy_hits),
            not_found: load(&self.not_found),
            puts: load(&self.puts),
            cached_puts: load(&self.cached_puts),
            already_stored: load(&self.already_stored),
            timeouts: load(&self.timeouts),
            deferred: load(&self.deferred),
            failures: load(&self.failures),
            big_asset_bypasses: load(&self.big_asset_bypasses),
            migrations: load(&self.migrations),
            ..Default::default()
        }
    }
}

/// Point-in-time view of the store's counters and queue/cache state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub gets: u64,
    pub cache_hits: u64,
    pub remote_fetches: u64,
    pub legacy_hits: u64,
    pub not_found: u64,
    pub puts: u64,
    pub cached_puts: u64,
    pub already_stored: u64,
    pub timeouts: u64,
    pub deferred: u64,
    pub failures: u64,
    pub big_asset_bypasses: u64,
    pub migrations: u64,

    /// Outstanding commits
    pub queue_depth: usize,
    pub dirty_entries: usize,
    pub cached_bytes: u64,
    /// Memory tier hit rate in percent
    pub hit_rate: f64,
    pub remote_health: String,
    pub bypassed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let stats = StoreStats::default();
        StoreStats::incr(&stats.gets);
        StoreStats::incr(&stats.gets);
        StoreStats::incr(&stats.deferred);

        let snap = stats.snapshot();
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.deferred, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["gets"], 2);
        assert_eq!(json["bigAssetBypasses"], 0);
    }
}
