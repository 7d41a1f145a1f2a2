//! Tiered storage for immutable assets
//!
//! Assets are stored through a local write-back cache into a remote object
//! store reached over streaming HTTP, with a read-only legacy backend
//! consulted on misses during migration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiered_assets::{AssetId, AssetRecord, AssetStore, StoreSettings};
//!
//! # async fn run() -> Result<(), tiered_assets::StoreError> {
//! let settings = StoreSettings::from_toml(r#"
//!     [asset_store]
//!     remote_url = "https://objects.example.net/v1"
//!     async_store = true
//! "#)?;
//!
//! let store = AssetStore::new(Arc::new(settings))?;
//! store.start().await?;
//!
//! let id = AssetId::new("4f1c0e2a-9b7d-4c55-8e21-6a3b9d0f7c11")?;
//! store.store(AssetRecord::new(id.clone(), "image/jp2", vec![0u8; 10_240])).await?;
//! let asset = store.fetch(&id).await?;
//! assert_eq!(asset.size, 10_240);
//!
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod cache;
pub mod commit;
pub mod error;
pub mod legacy;
pub mod remote;
pub mod settings;
pub mod stats;
pub mod store;

pub use asset::{AssetBody, AssetId, AssetMeta, AssetRecord, BodyStream, Payload};
pub use cache::{CacheTier, CapacityPressure};
pub use commit::{CommitQueue, CommitState, ExponentialBackoff, RetryPolicy, ShutdownReport};
pub use error::{StoreError, StoreResult};
pub use legacy::{HttpLegacyBackend, LegacyAsset, LegacyBackend};
pub use remote::{HttpTransport, RemoteStore, Transport, TransportRequest, TransportResponse, UploadOptions};
pub use settings::{FaultInjection, QueueFullPolicy, StoreSettings};
pub use stats::StatsSnapshot;
pub use store::{AssetStore, AssetStoreBuilder, StoreOutcome};
