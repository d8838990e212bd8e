//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use tessera::telemetry;
use tessera::{
    BlobMeta, BlobStore, BoundingBox, ByteBudgetCache, FetchRequest, Fetcher, LayerMemoryManager,
    LayerPriority, MemoryLimits, PersistentBlobStore, PersistentConfig, Result, RetryConfig,
    StoredBlob, StreamerConfig, TesseraError, TileStreamer, Viewport,
};

// ============================================================================
// Mocks
// ============================================================================

/// Fails the root tile permanently, serves everything else.
struct RootlessServer;

#[async_trait]
impl Fetcher for RootlessServer {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes> {
        if request.url.ends_with("tile=1/0/0") {
            return Err(TesseraError::Api {
                status: 404,
                message: "Not Found".into(),
            });
        }
        Ok(Bytes::from_static(b"tile"))
    }
}

struct DeadDisk;

#[async_trait]
impl BlobStore for DeadDisk {
    fn name(&self) -> &str {
        "dead"
    }

    async fn get(&self, _key: &str) -> Result<Option<StoredBlob>> {
        Err(TesseraError::Io(std::io::Error::other("disk gone")))
    }

    async fn put(&self, _key: &str, _blob: &StoredBlob) -> Result<()> {
        Err(TesseraError::Io(std::io::Error::other("disk gone")))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlobMeta>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a metric name and, optionally, one label.
fn counter_total(snapshot: &SnapshotVec, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .filter(|(key, _, _, _)| match label {
            Some((k, v)) => key
                .key()
                .labels()
                .any(|l| l.key() == k && l.value() == v),
            None => true,
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Runs async code within a local recorder scope on the multi-thread runtime.
fn with_recorder<F, T>(recorder: &DebuggingRecorder, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    metrics::with_local_recorder(recorder, || {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn memory_cache_records_hits_misses_and_evictions() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let cache = ByteBudgetCache::new(10);
        cache.put("a", Bytes::from_static(b"12345")).unwrap();
        cache.get("a");
        cache.get("b");
        cache.put("c", Bytes::from_static(b"123456789")).unwrap();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    let memory = Some(("tier", "memory"));
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL, memory), 1);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL, memory), 1);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_EVICTIONS_TOTAL, memory), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn tile_fetch_outcomes_are_labelled() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let summary = with_recorder(&recorder, async {
        let streamer = TileStreamer::new(
            Arc::new(RootlessServer),
            StreamerConfig::new().retry(RetryConfig::disabled()),
        );
        let viewport = Viewport::new(BoundingBox::new(-180.0, -85.0, 180.0, 85.0), 1.0);
        streamer
            .stream_tiles("https://t/scene.tif", &viewport, |_, _| {}, |_, _| {})
            .await
    });
    assert_eq!(summary.total, 4);

    let snapshot = snapshotter.snapshot().into_vec();
    let fetches = telemetry::TILE_FETCHES_TOTAL;
    assert_eq!(counter_total(&snapshot, fetches, Some(("status", "ok"))), 3);
    assert_eq!(counter_total(&snapshot, fetches, Some(("status", "error"))), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn persistent_errors_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let found = with_recorder(&recorder, async {
        let store = PersistentBlobStore::open(Arc::new(DeadDisk), PersistentConfig::default()).await;
        store.put("k", Bytes::from_static(b"v"), 1).await;
        store.get("k").await
    });
    assert!(found.is_none());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_total(&snapshot, telemetry::PERSISTENT_STORE_ERRORS_TOTAL, Some(("operation", "put"))),
        1
    );
    assert_eq!(
        counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL, Some(("tier", "persistent"))),
        1
    );
}

#[test]
fn layer_manager_records_evictions_rejections_and_pressure() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let manager = LayerMemoryManager::new(MemoryLimits::new().max_total_memory(100));
        manager.add_layer("a", Bytes::from(vec![0u8; 60]), LayerPriority::Low).unwrap();
        manager.add_layer("b", Bytes::from(vec![0u8; 60]), LayerPriority::High).unwrap();
        assert!(manager.add_layer("c", Bytes::from(vec![0u8; 60]), LayerPriority::High).is_err());
        manager.relieve_memory_pressure();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::LAYER_EVICTIONS_TOTAL, None), 1);
    assert_eq!(counter_total(&snapshot, telemetry::LAYER_REJECTIONS_TOTAL, None), 1);
    assert_eq!(counter_total(&snapshot, telemetry::MEMORY_PRESSURE_EVENTS_TOTAL, None), 1);
}
