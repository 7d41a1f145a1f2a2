//! Store settings
//!
//! Immutable configuration snapshot for the engine. Built once at start-up,
//! validated, then shared as `Arc<StoreSettings>` with every component.
//!
//! ```
//! use tiered_assets::StoreSettings;
//!
//! let settings = StoreSettings::from_toml(r#"
//!     [asset_store]
//!     remote_url = "https://objects.example.net/v1/assets"
//!     async_store = true
//!     worker_count = 4
//! "#).unwrap();
//!
//! assert!(settings.async_store);
//! assert_eq!(settings.worker_count, 4);
//! assert_eq!(settings.max_pending_commits(), 4);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{StoreError, StoreResult};

/// Name of the settings section in the configuration document
pub const SETTINGS_SECTION: &str = "asset_store";

/// Largest asset kept in the in-memory tier (1 MiB)
pub const DEFAULT_CACHEABLE_SIZE: u64 = 1024 * 1024;

/// Assets above this size are always moved by chunked streaming (64 KiB)
pub const DEFAULT_STREAMING_THRESHOLD: u64 = 64 * 1024;

/// What `enqueue` does when the commit backlog is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for a slot
    #[default]
    Block,
    /// Fail with `StoreError::QueueFull`
    Reject,
}

/// Test-only switches for exercising failure paths without a network
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FaultInjection {
    /// Number of commit attempts that fail with a forced timeout before the
    /// connector is actually called. `u32::MAX` makes the timeout persistent.
    pub forced_commit_timeouts: u32,
}

/// Immutable engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Base URL of the remote object store (required)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Prefix for remote container names
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Optional credentials for the remote store (HTTP basic auth)
    #[serde(default)]
    pub remote_username: Option<String>,
    #[serde(default)]
    pub remote_api_key: Option<String>,

    /// Keep recently used small assets in memory
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Byte budget for the in-memory tier
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,

    /// Assets larger than this bypass the in-memory tier
    #[serde(default = "default_cacheable_size")]
    pub cacheable_size_threshold: u64,

    /// Assets larger than this are never fully buffered
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold: u64,

    /// Acknowledge stores before the remote copy is confirmed
    #[serde(default = "default_true")]
    pub write_back: bool,

    /// Commit write-back entries off the caller's path
    #[serde(default)]
    pub async_store: bool,

    /// Consult the legacy backend when the remote store misses
    #[serde(default)]
    pub legacy_read: bool,

    /// Base URL of the legacy backend (required when `legacy_read` is set)
    #[serde(default)]
    pub legacy_url: Option<String>,

    /// Copy legacy hits into the remote store
    #[serde(default)]
    pub migrate_on_legacy_hit: bool,

    /// Refuse to replace an existing remote object
    #[serde(default = "default_true")]
    pub overwrite_protection: bool,

    /// Number of commit workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Outstanding commits allowed before backpressure (defaults to `worker_count`)
    #[serde(default)]
    pub commit_backlog: Option<usize>,

    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,

    /// Total commit attempts per task, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_backoff_factor: f64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Chunk size for streamed transfers
    #[serde(default = "default_transfer_buffer_size")]
    pub transfer_buffer_size: usize,

    /// Cap on bytes transferred per upload
    #[serde(default)]
    pub max_transfer_bytes: Option<u64>,

    /// Pause before replaying an upload after a protocol violation
    #[serde(default = "default_protocol_retry_pause_ms")]
    pub protocol_retry_pause_ms: u64,

    /// Remote operations slower than this are logged
    #[serde(default = "default_slow_operation_ms")]
    pub slow_operation_ms: u64,

    /// How long the commit queue may drain on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Interval of the background cache maintenance pass
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// How long a committed spool file stays readable before deletion
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,

    /// Directory for spooled (dirty or large) payloads
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    #[serde(default)]
    pub fault_injection: FaultInjection,
}

fn default_true() -> bool {
    true
}

fn default_container_prefix() -> String {
    "assets_".to_string()
}

fn default_cache_capacity() -> u64 {
    20 * 1024 * 1024 // 20 MB
}

fn default_cacheable_size() -> u64 {
    DEFAULT_CACHEABLE_SIZE
}

fn default_streaming_threshold() -> u64 {
    DEFAULT_STREAMING_THRESHOLD
}

fn default_worker_count() -> usize {
    8
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_read_timeout_ms() -> u64 {
    45_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_transfer_buffer_size() -> usize {
    16 * 1024
}

fn default_protocol_retry_pause_ms() -> u64 {
    1_000
}

fn default_slow_operation_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_maintenance_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_settle_window_ms() -> u64 {
    60_000
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            remote_url: None,
            container_prefix: default_container_prefix(),
            remote_username: None,
            remote_api_key: None,
            cache_enabled: true,
            cache_capacity_bytes: default_cache_capacity(),
            cacheable_size_threshold: default_cacheable_size(),
            streaming_threshold: default_streaming_threshold(),
            write_back: true,
            async_store: false,
            legacy_read: false,
            legacy_url: None,
            migrate_on_legacy_hit: false,
            overwrite_protection: true,
            worker_count: default_worker_count(),
            commit_backlog: None,
            queue_full_policy: QueueFullPolicy::Block,
            max_retries: default_max_retries(),
            retry_initial_backoff_ms: default_retry_initial_ms(),
            retry_max_backoff_ms: default_retry_max_ms(),
            retry_backoff_factor: default_retry_factor(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            transfer_buffer_size: default_transfer_buffer_size(),
            max_transfer_bytes: None,
            protocol_retry_pause_ms: default_protocol_retry_pause_ms(),
            slow_operation_ms: default_slow_operation_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            settle_window_ms: default_settle_window_ms(),
            spool_dir: None,
            fault_injection: FaultInjection::default(),
        }
    }
}

/// Wrapper for the configuration document; only our section is read
#[derive(Deserialize)]
struct SettingsDocument {
    #[serde(rename = "asset_store")]
    asset_store: Option<StoreSettings>,
}

impl StoreSettings {
    /// Parse the `[asset_store]` section of a TOML document and validate it
    pub fn from_toml(document: &str) -> StoreResult<Self> {
        let doc: SettingsDocument = toml::from_str(document)
            .map_err(|e| StoreError::Configuration(format!("Invalid settings document: {}", e)))?;

        let settings = doc.asset_store.ok_or_else(|| {
            StoreError::Configuration(format!("Missing [{}] settings section", SETTINGS_SECTION))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check that the snapshot is usable. The engine refuses to start otherwise.
    pub fn validate(&self) -> StoreResult<()> {
        if self.remote_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(StoreError::Configuration(
                "remote_url is required: no backend target configured".to_string(),
            ));
        }
        if self.legacy_read && self.legacy_url.is_none() {
            return Err(StoreError::Configuration(
                "legacy_read requires the legacy_url setting".to_string(),
            ));
        }
        if self.async_store && !self.write_back {
            return Err(StoreError::Configuration(
                "async_store cannot be combined with write-through mode (write_back = false)"
                    .to_string(),
            ));
        }
        if self.remote_username.is_some() != self.remote_api_key.is_some() {
            return Err(StoreError::Configuration(
                "remote_username and remote_api_key must be set together".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(StoreError::Configuration("worker_count must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(StoreError::Configuration("max_retries must be at least 1".to_string()));
        }
        if self.transfer_buffer_size == 0 {
            return Err(StoreError::Configuration(
                "transfer_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.streaming_threshold > self.cacheable_size_threshold {
            return Err(StoreError::Configuration(
                "streaming_threshold must not exceed cacheable_size_threshold".to_string(),
            ));
        }
        if self.retry_backoff_factor < 1.0 {
            return Err(StoreError::Configuration(
                "retry_backoff_factor must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Outstanding commits allowed before enqueue applies backpressure
    pub fn max_pending_commits(&self) -> usize {
        self.commit_backlog.unwrap_or(self.worker_count).max(1)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn protocol_retry_pause(&self) -> Duration {
        Duration::from_millis(self.protocol_retry_pause_ms)
    }

    pub fn slow_operation(&self) -> Duration {
        Duration::from_millis(self.slow_operation_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    /// Spool directory, falling back to the platform cache directory
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("tiered-assets")
                .join("writeback")
        })
    }
}
