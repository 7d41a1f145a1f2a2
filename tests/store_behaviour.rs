//! End-to-end behaviour of the store facade against in-process backends

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::TryStreamExt;

use common::{eventually, init_tracing, settings, FakeLegacy, FakeObjectStore};
use tiered_assets::asset::chunk_bytes;
use tiered_assets::{
    AssetBody, AssetId, AssetRecord, AssetStore, CommitState, FaultInjection, RemoteStore, StoreError,
    StoreOutcome, StoreSettings,
};

fn id(s: &str) -> AssetId {
    AssetId::new(s).unwrap()
}

fn build(settings: Arc<StoreSettings>, remote: &Arc<FakeObjectStore>) -> AssetStore {
    AssetStore::builder(settings).transport(remote.clone()).build().unwrap()
}

fn url_of(store: &AssetStore, id: &AssetId) -> String {
    store.remote().object_url(id)
}

async fn body_bytes(record: AssetRecord) -> Bytes {
    record.body.collect().await.unwrap()
}

#[tokio::test]
async fn repeated_store_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);
    store.start().await.unwrap();

    let asset = id("b1e0c3d2-aaaa-4bbb-8ccc-000000000001");
    let data = Bytes::from_static(b"texture bytes");

    let first = store.store(AssetRecord::new(asset.clone(), "image/jp2", data.clone())).await.unwrap();
    let second = store.store(AssetRecord::new(asset.clone(), "image/jp2", data.clone())).await.unwrap();

    assert_eq!(first, StoreOutcome::Committed);
    assert_eq!(second, StoreOutcome::AlreadyStored);
    assert_eq!(remote.completed_puts(), 1);

    let err = store
        .store(AssetRecord::new(asset.clone(), "image/jp2", Bytes::from_static(b"other bytes")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ImmutableViolation(_)));
    assert_eq!(store.stats().already_stored, 1);
}

#[tokio::test]
async fn concurrent_writers_of_one_id_commit_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.set_put_delay(Duration::from_millis(50));
    let store = Arc::new(build(settings(dir.path(), |s| s.write_back = false), &remote));
    store.start().await.unwrap();

    let asset = id("race");
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let asset = asset.clone();
        handles.push(tokio::spawn(async move {
            store.store(AssetRecord::new(asset, "text/plain", Bytes::from_static(b"same"))).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(outcomes.iter().filter(|o| **o == StoreOutcome::Committed).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == StoreOutcome::AlreadyStored).count(), 3);
    assert_eq!(remote.completed_puts(), 1);
}

/// 10 KB asset in async write-back mode: readable at once, clean after drain
#[tokio::test]
async fn async_store_is_readable_before_commit() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.set_put_delay(Duration::from_millis(300));
    let store = build(settings(dir.path(), |s| s.async_store = true), &remote);
    store.start().await.unwrap();

    let asset = id("a1a1a1a1-0000-4000-8000-000000010240");
    let data = Bytes::from(vec![0xA1u8; 10 * 1024]);

    let outcome = store.store(AssetRecord::new(asset.clone(), "image/jp2", data.clone())).await.unwrap();
    assert_eq!(outcome, StoreOutcome::Queued);
    assert!(store.cache().is_dirty(&asset));

    let fetched = store.fetch(&asset).await.unwrap();
    assert_eq!(fetched.size, data.len() as u64);
    assert_eq!(body_bytes(fetched).await, data);
    assert_eq!(remote.completed_puts(), 0, "fetch must not wait for the commit");

    store.flush().await;
    assert!(!store.cache().is_dirty(&asset));
    assert_eq!(remote.object(&url_of(&store, &asset)), Some(data));
    assert_eq!(store.queue().state(&asset), None);
}

#[tokio::test]
async fn write_back_returns_before_commit_and_write_through_blocks() {
    init_tracing();
    let delay = Duration::from_millis(200);

    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.set_put_delay(delay);
    let store = build(settings(dir.path(), |s| s.async_store = true), &remote);
    store.start().await.unwrap();

    let started = Instant::now();
    store.store(AssetRecord::new(id("wb"), "text/plain", Bytes::from_static(b"wb"))).await.unwrap();
    assert!(started.elapsed() < delay);
    assert_eq!(remote.completed_puts(), 0);
    store.flush().await;

    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.set_put_delay(delay);
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);
    store.start().await.unwrap();

    let started = Instant::now();
    let outcome = store
        .store(AssetRecord::new(id("wt"), "text/plain", Bytes::from_static(b"wt")))
        .await
        .unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(outcome, StoreOutcome::Committed);
    assert_eq!(remote.completed_puts(), 1);
}

#[tokio::test]
async fn large_streams_are_never_buffered_whole() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);
    store.start().await.unwrap();

    let size = 3 * 1024 * 1024;
    let data = Bytes::from(vec![7u8; size]);
    let asset = id("big-stream");
    let record = AssetRecord::streamed(asset.clone(), "application/octet-stream", size as u64, chunk_bytes(data.clone(), 32 * 1024));

    let outcome = store.store(record).await.unwrap();
    assert_eq!(outcome, StoreOutcome::Committed);

    let puts = remote.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert!(puts[0].streamed);
    assert!(puts[0].max_chunk <= store.settings().transfer_buffer_size);
    assert_eq!(puts[0].bytes, size);
    assert_eq!(puts[0].declared_length, Some(size as u64));

    // Too large for the memory tier: the read comes back as a stream
    let fetched = store.fetch(&asset).await.unwrap();
    assert!(matches!(fetched.body, AssetBody::Stream(_)));
    let chunks: Vec<Bytes> = match fetched.body {
        AssetBody::Stream(s) => s.try_collect().await.unwrap(),
        AssetBody::Bytes(_) => unreachable!(),
    };
    assert!(chunks.iter().all(|c| c.len() <= 64 * 1024));
    assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), size);
    assert_eq!(store.stats().big_asset_bypasses, 1);
}

#[tokio::test]
async fn short_stream_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);

    let record = AssetRecord::streamed(
        id("short"),
        "application/octet-stream",
        500_000,
        chunk_bytes(Bytes::from(vec![1u8; 1000]), 100),
    );
    let err = store.store(record).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidAsset(_)));
    assert_eq!(remote.completed_puts(), 0);
}

#[tokio::test]
async fn persistent_timeout_fails_after_exactly_max_retries() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(
        settings(dir.path(), |s| {
            s.async_store = true;
            s.max_retries = 3;
            s.fault_injection = FaultInjection {
                forced_commit_timeouts: u32::MAX,
            };
        }),
        &remote,
    );
    store.start().await.unwrap();

    let asset = id("never-lands");
    store
        .store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"lost?")))
        .await
        .unwrap();
    store.flush().await;

    assert_eq!(store.queue().state(&asset), Some(CommitState::Failed));
    assert_eq!(store.queue().stats().attempts, 3);
    assert_eq!(store.queue().stats().injected_timeouts, 3);
    assert_eq!(remote.put_attempts.load(Ordering::SeqCst), 0);
    assert!(store.cache().is_dirty(&asset), "failed commits stay dirty");
}

#[tokio::test]
async fn backend_timeouts_count_against_max_retries() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.fail_puts_with(Some(StoreError::Timeout));
    let store = build(
        settings(dir.path(), |s| {
            s.async_store = true;
            s.max_retries = 4;
        }),
        &remote,
    );
    store.start().await.unwrap();

    let asset = id("slow-backend");
    store.store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"x"))).await.unwrap();
    store.flush().await;

    assert_eq!(remote.put_attempts.load(Ordering::SeqCst), 4);
    assert_eq!(store.queue().failed(), vec![asset]);
}

#[tokio::test]
async fn sync_write_back_defers_transient_failures_to_queue() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.fail_next(StoreError::Timeout);
    let store = build(settings(dir.path(), |_| {}), &remote);
    store.start().await.unwrap();

    let asset = id("deferred");
    let data = Bytes::from_static(b"retry me later");
    let outcome = store.store(AssetRecord::new(asset.clone(), "text/plain", data.clone())).await.unwrap();
    assert_eq!(outcome, StoreOutcome::Deferred);

    store.flush().await;
    assert!(!store.cache().is_dirty(&asset));
    assert_eq!(remote.object(&url_of(&store, &asset)), Some(data));
    assert_eq!(store.stats().deferred, 1);
}

#[tokio::test]
async fn sync_write_back_surfaces_permanent_failures() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.fail_next(StoreError::Forbidden("bad credentials".into()));
    let store = build(settings(dir.path(), |_| {}), &remote);
    store.start().await.unwrap();

    let asset = id("denied");
    let err = store
        .store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"x")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Forbidden(_)));
    assert!(!store.cache().is_dirty(&asset));
    assert_eq!(store.stats().failures, 1);
}

/// A single protocol violation is absorbed by the connector
#[tokio::test]
async fn protocol_violation_is_retried_without_buffering() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.fail_next(StoreError::Protocol("HTTP/1.0 response to chunked request".into()));
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);
    store.start().await.unwrap();

    let asset = id("a2");
    let outcome = store
        .store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"small body")))
        .await
        .unwrap();
    assert_eq!(outcome, StoreOutcome::Committed);

    assert_eq!(remote.put_attempts.load(Ordering::SeqCst), 2);
    let puts = remote.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert!(!puts[0].allow_write_buffering);
    assert!(puts[0].streamed);
    assert_eq!(store.remote().health_status(), "healthy");
}

#[tokio::test]
async fn legacy_fallback_only_when_enabled() {
    init_tracing();
    let asset = id("old-asset");

    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let legacy = FakeLegacy::with(&asset, b"from the old grid");
    let store = AssetStore::builder(settings(dir.path(), |s| {
        s.legacy_read = true;
        s.legacy_url = Some("http://legacy.test".to_string());
    }))
    .transport(remote.clone())
    .legacy_backend(legacy.clone())
    .build()
    .unwrap();

    let fetched = store.fetch(&asset).await.unwrap();
    assert_eq!(fetched.content_type, "image/jp2");
    assert_eq!(body_bytes(fetched).await, Bytes::from_static(b"from the old grid"));
    assert_eq!(store.stats().legacy_hits, 1);

    // Second read is served by the cache
    store.fetch(&asset).await.unwrap();
    assert_eq!(legacy.lookups.load(Ordering::SeqCst), 1);

    let dir = tempfile::tempdir().unwrap();
    let legacy = FakeLegacy::with(&asset, b"from the old grid");
    let store = AssetStore::builder(settings(dir.path(), |_| {}))
        .transport(remote.clone())
        .legacy_backend(legacy.clone())
        .build()
        .unwrap();

    let err = store.fetch(&asset).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(legacy.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(store.stats().not_found, 1);
}

#[tokio::test]
async fn legacy_hits_migrate_when_enabled() {
    init_tracing();
    let asset = id("migrate-me");
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = AssetStore::builder(settings(dir.path(), |s| {
        s.legacy_read = true;
        s.legacy_url = Some("http://legacy.test".to_string());
        s.migrate_on_legacy_hit = true;
    }))
    .transport(remote.clone())
    .legacy_backend(FakeLegacy::with(&asset, b"legacy payload"))
    .build()
    .unwrap();

    store.fetch(&asset).await.unwrap();

    let url = url_of(&store, &asset);
    assert!(eventually(|| remote.object(&url).is_some()).await);
    assert!(eventually(|| store.stats().migrations == 1).await);
}

#[tokio::test]
async fn migration_respects_overwrite_protection() {
    init_tracing();
    let asset = id("already-there");
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = AssetStore::builder(settings(dir.path(), |s| {
        s.legacy_read = true;
        s.legacy_url = Some("http://legacy.test".to_string());
        s.migrate_on_legacy_hit = true;
    }))
    .transport(remote.clone())
    .legacy_backend(FakeLegacy::with(&asset, b"legacy copy"))
    .build()
    .unwrap();

    // The remote misses on the first GET, then another client uploads
    // the object before the migration runs.
    remote.fail_next(StoreError::NotFound("race".into()));
    let url = url_of(&store, &asset);
    let fetched = store.fetch(&asset).await.unwrap();
    remote.insert(&url, "image/jp2", Bytes::from_static(b"remote copy"));
    drop(fetched);

    assert!(eventually(|| remote.put_attempts.load(Ordering::SeqCst) >= 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.stats().migrations, 0);
    assert_eq!(remote.object(&url), Some(Bytes::from_static(b"remote copy")));
}

#[tokio::test]
async fn remote_fetches_are_cached_clean() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |_| {}), &remote);

    let asset = id("c0ffee00-1111-4222-8333-444455556666");
    remote.insert(&url_of(&store, &asset), "image/png", Bytes::from(vec![9u8; 2048]));

    let first = store.fetch(&asset).await.unwrap();
    assert_eq!(first.content_type, "image/png");
    assert_eq!(body_bytes(first).await.len(), 2048);
    store.fetch(&asset).await.unwrap();

    assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    let stats = store.stats();
    assert_eq!(stats.remote_fetches, 1);
    assert_eq!(stats.cache_hits, 1);
    assert!(!store.cache().is_dirty(&asset));
}

#[tokio::test]
async fn missing_everywhere_is_not_found() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |_| {}), &remote);

    let err = store.fetch(&id("nowhere")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn dirty_entries_survive_capacity_pressure() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    remote.set_put_delay(Duration::from_secs(30));
    let store = build(
        settings(dir.path(), |s| {
            s.async_store = true;
            s.cache_capacity_bytes = 4096;
            s.cacheable_size_threshold = 2048;
            s.streaming_threshold = 1024;
            s.worker_count = 1;
            s.commit_backlog = Some(64);
            s.shutdown_grace_ms = 10;
        }),
        &remote,
    );
    store.start().await.unwrap();

    let ids: Vec<AssetId> = (0..10).map(|i| id(&format!("pinned-{}", i))).collect();
    for (i, asset) in ids.iter().enumerate() {
        let data = Bytes::from(vec![i as u8; 1000]);
        let outcome = store.store(AssetRecord::new(asset.clone(), "text/plain", data)).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Queued);
    }
    store.cache().maintain();

    let pressure = store.cache().check_pressure();
    assert!(pressure.stalled);
    assert_eq!(pressure.dirty_bytes, 10_000);

    for (i, asset) in ids.iter().enumerate() {
        let fetched = store.fetch(asset).await.unwrap();
        assert_eq!(body_bytes(fetched).await, Bytes::from(vec![i as u8; 1000]));
    }
    assert_eq!(remote.gets.load(Ordering::SeqCst), 0);

    let report = store.shutdown().await;
    assert!(!report.drained);
    assert!(!report.outstanding.is_empty());
}

#[tokio::test]
async fn spooled_dirty_entries_are_recovered_on_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let tweak = |s: &mut StoreSettings| {
        s.async_store = true;
        s.cacheable_size_threshold = 4096;
        s.streaming_threshold = 1024;
        s.shutdown_grace_ms = 10;
    };
    let asset = id("survives-restart");
    let data = Bytes::from(vec![4u8; 20_000]);

    {
        let remote = FakeObjectStore::new();
        remote.fail_puts_with(Some(StoreError::Connectivity("backend down".into())));
        let store = build(settings(dir.path(), |s| {
            tweak(s);
            s.max_retries = 1;
        }), &remote);
        store.start().await.unwrap();
        store.store(AssetRecord::new(asset.clone(), "image/jp2", data.clone())).await.unwrap();
        store.flush().await;
        assert_eq!(store.queue().state(&asset), Some(CommitState::Failed));
        store.shutdown().await;
    }

    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), tweak), &remote);
    assert_eq!(store.start().await.unwrap(), 1);
    store.flush().await;

    assert_eq!(remote.object(&url_of(&store, &asset)), Some(data));
    assert!(!store.cache().is_dirty(&asset));
}

#[tokio::test]
async fn delete_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |_| {}), &remote);
    assert!(matches!(store.delete(&id("anything")), Err(StoreError::Unsupported(_))));
}

#[tokio::test]
async fn invalid_mode_combinations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let result = AssetStore::builder(settings(dir.path(), |s| {
        s.async_store = true;
        s.write_back = false;
    }))
    .transport(remote)
    .build();
    assert!(matches!(result.err(), Some(StoreError::Configuration(_))));

    let result = AssetStore::new(Arc::new(StoreSettings::default()));
    assert!(matches!(result.err(), Some(StoreError::Configuration(_))));
}

#[tokio::test]
async fn bypass_mode_commits_synchronously() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let remote = FakeObjectStore::new();
    let store = build(
        settings(&blocker.join("spool"), |s| s.async_store = true),
        &remote,
    );
    store.start().await.unwrap();
    assert!(store.stats().bypassed);

    let asset = id("no-local-disk");
    let size = 200_000u64;
    let record = AssetRecord::streamed(
        asset.clone(),
        "application/octet-stream",
        size,
        chunk_bytes(Bytes::from(vec![2u8; size as usize]), 16 * 1024),
    );
    let outcome = store.store(record).await.unwrap();
    assert_eq!(outcome, StoreOutcome::Committed);
    assert_eq!(remote.completed_puts(), 1);
    assert!(remote.puts.lock().unwrap()[0].streamed);
}

#[tokio::test]
async fn transfer_cap_limits_declared_length() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(
        settings(dir.path(), |s| {
            s.write_back = false;
            s.max_transfer_bytes = Some(100_000);
        }),
        &remote,
    );

    let data = Bytes::from(vec![1u8; 250_000]);
    store.store(AssetRecord::new(id("capped"), "application/octet-stream", data)).await.unwrap();

    let puts = remote.puts.lock().unwrap().clone();
    assert_eq!(puts[0].declared_length, Some(100_000));
    assert_eq!(puts[0].bytes, 100_000);
}

#[test]
fn remote_store_requires_url() {
    let settings = Arc::new(StoreSettings::default());
    let err = RemoteStore::new(settings, FakeObjectStore::new()).err();
    assert!(matches!(err, Some(StoreError::Configuration(_))));
}

/// A 412 on upload is only a duplicate when the remote copy holds the same bytes
#[tokio::test]
async fn existing_remote_copy_with_different_bytes_is_rejected() {
    init_tracing();
    for write_back in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeObjectStore::new();
        let store = build(settings(dir.path(), |s| s.write_back = write_back), &remote);
        store.start().await.unwrap();

        let asset = id("seeded-elsewhere");
        remote.insert(&url_of(&store, &asset), "text/plain", Bytes::from_static(b"original bytes"));

        let err = store
            .store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"DIFFERENT bytes")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ImmutableViolation(_)), "write_back={}", write_back);
        assert!(!store.cache().is_dirty(&asset));
        assert!(store.cache().meta(&asset).is_none());

        let fetched = store.fetch(&asset).await.unwrap();
        assert_eq!(body_bytes(fetched).await, Bytes::from_static(b"original bytes"));
        assert_eq!(remote.object(&url_of(&store, &asset)), Some(Bytes::from_static(b"original bytes")));
    }
}

#[tokio::test]
async fn existing_remote_copy_with_same_bytes_is_already_stored() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let data = Bytes::from_static(b"shared texture");

    // Seeded without a sha1 header, so the remote body gets digested
    let seeded = id("seeded-same");
    {
        let store = build(settings(dir.path(), |s| s.write_back = false), &remote);
        remote.insert(&url_of(&store, &seeded), "text/plain", data.clone());
        let outcome = store.store(AssetRecord::new(seeded.clone(), "text/plain", data.clone())).await.unwrap();
        assert_eq!(outcome, StoreOutcome::AlreadyStored);
    }

    // Uploaded by another instance, which recorded the sha1 header
    let uploaded = id("uploaded-twice");
    let first = build(settings(dir.path(), |s| s.write_back = false), &remote);
    first.store(AssetRecord::new(uploaded.clone(), "text/plain", data.clone())).await.unwrap();

    let second = build(settings(dir.path(), |_| {}), &remote);
    second.start().await.unwrap();
    let outcome = second.store(AssetRecord::new(uploaded.clone(), "text/plain", data.clone())).await.unwrap();
    assert_eq!(outcome, StoreOutcome::AlreadyStored);
    assert!(!second.cache().is_dirty(&uploaded));
    assert_eq!(remote.completed_puts(), 3);
}

#[tokio::test]
async fn queued_store_over_different_remote_copy_fails() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |s| s.async_store = true), &remote);
    store.start().await.unwrap();

    let asset = id("queued-clash");
    remote.insert(&url_of(&store, &asset), "text/plain", Bytes::from_static(b"original bytes"));

    let outcome = store
        .store(AssetRecord::new(asset.clone(), "text/plain", Bytes::from_static(b"DIFFERENT bytes")))
        .await
        .unwrap();
    assert_eq!(outcome, StoreOutcome::Queued);
    store.flush().await;

    assert_eq!(store.queue().state(&asset), Some(CommitState::Failed));
    assert!(!store.cache().is_dirty(&asset));
    let fetched = store.fetch(&asset).await.unwrap();
    assert_eq!(body_bytes(fetched).await, Bytes::from_static(b"original bytes"));
}

#[tokio::test]
async fn endless_stream_with_small_declared_size_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), |s| s.write_back = false), &remote);

    let endless = || {
        Box::pin(futures::stream::repeat_with(|| {
            Ok::<_, StoreError>(Bytes::from_static(b"0123456789abcdef"))
        })) as tiered_assets::BodyStream
    };

    let asset = id("endless");
    let err = store
        .store(AssetRecord::streamed(asset.clone(), "text/plain", 100, endless()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidAsset(_)));
    assert_eq!(remote.completed_puts(), 0);

    // The duplicate check reads no further than the stored size either
    let data = Bytes::from(vec![b'x'; 100]);
    store.store(AssetRecord::new(asset.clone(), "text/plain", data)).await.unwrap();
    let err = store
        .store(AssetRecord::streamed(asset, "text/plain", 100, endless()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ImmutableViolation(_)));
}

#[tokio::test]
async fn settled_spool_files_serve_reads_and_are_not_recommitted() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let tweak = |s: &mut StoreSettings| {
        s.cacheable_size_threshold = 4096;
        s.streaming_threshold = 1024;
        s.settle_window_ms = 60_000;
    };
    let asset = id("settling");
    let data = Bytes::from(vec![8u8; 20_000]);

    {
        let remote = FakeObjectStore::new();
        let store = build(settings(dir.path(), tweak), &remote);
        store.start().await.unwrap();
        let record = AssetRecord::streamed(
            asset.clone(),
            "application/octet-stream",
            data.len() as u64,
            chunk_bytes(data.clone(), 4096),
        );
        assert_eq!(store.store(record).await.unwrap(), StoreOutcome::Committed);
        assert!(!store.cache().is_dirty(&asset));

        let fetched = store.fetch(&asset).await.unwrap();
        assert_eq!(body_bytes(fetched).await, data);
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0, "served from the settled spool file");
        store.shutdown().await;
    }

    let remote = FakeObjectStore::new();
    let store = build(settings(dir.path(), tweak), &remote);
    assert_eq!(store.start().await.unwrap(), 0);
    store.flush().await;
    assert_eq!(remote.put_attempts.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("settling.asset").exists());
}
