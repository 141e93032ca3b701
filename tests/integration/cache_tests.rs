//! Cell cache integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one key cause a single storage read
//! - Repeated budgeted requests keep one queued load per key
//! - Missing chunks and transport failures give zero-filled cells
//! - Budgeted placeholders and blocking reads of warmed cells
//! - close() followed by get() behaves like a fresh cache
//! - Invalid keys are rejected and resident cells can be bounded

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ome_zarr_cache::{
    CacheConfig, CacheError, CellCache, ChunkKey, ElementKind, LoadingStrategy, TypedCell,
};

use super::test_utils::{
    five_d_chunk_value, five_d_store, multiscales, planar_store_with_labels, zarray,
    MemorySource, MemoryStore,
};

fn new_cache(store: &MemoryStore) -> CellCache<MemorySource> {
    CellCache::new(store.source(), CacheConfig::new().with_fetcher_threads(2))
}

fn assert_constant(cell: &TypedCell, value: f64) {
    assert!(cell.is_valid());
    assert_eq!(cell.data().value_range(), Some((value, value)));
}

/// Poll with the budgeted strategy until the cell is resident.
async fn wait_until_resident(cache: &CellCache<MemorySource>, key: &ChunkKey) -> Arc<TypedCell> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let cell = cache.get(key, LoadingStrategy::Budgeted).await.unwrap();
            if cell.is_valid() {
                return cell;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cell never became resident")
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_budgeted_requests_read_once() {
    let store = five_d_store();
    store.set_delay(Duration::from_millis(50));
    let cache = Arc::new(new_cache(&store));
    let key = cache.cell_key(0, 0, 0, &[0, 0, 0]).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache.get(&key, LoadingStrategy::Budgeted).await.unwrap()
        }));
    }
    for handle in handles {
        let cell = handle.await.unwrap();
        assert_eq!(cell.dims(), &[50, 50, 5]);
    }

    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 7.0);
    assert_eq!(store.chunk_reads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_blocking_requests_read_once() {
    let store = five_d_store();
    store.set_delay(Duration::from_millis(50));
    let cache = Arc::new(new_cache(&store));
    let key = cache.cell_key(1, 2, 0, &[1, 0, 0]).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache.get(&key, LoadingStrategy::Blocking).await.unwrap()
        }));
    }

    let mut cells = Vec::new();
    for handle in handles {
        cells.push(handle.await.unwrap());
    }

    for cell in &cells {
        assert_constant(cell, 42.0);
        assert!(Arc::ptr_eq(cell, &cells[0]));
    }
    assert_eq!(store.chunk_reads(), 1);
}

#[tokio::test]
async fn test_repeated_budgeted_requests_queue_one_load() {
    let store = five_d_store();
    store.set_delay(Duration::from_millis(300));
    let cache = CellCache::new(store.source(), CacheConfig::new().with_fetcher_threads(1));
    let busy = cache.cell_key(0, 0, 0, &[0, 0, 0]).await.unwrap();
    let waiting = cache.cell_key(0, 0, 0, &[1, 0, 0]).await.unwrap();

    cache.get(&busy, LoadingStrategy::Budgeted).await.unwrap();
    // Let the only worker pick up the first load
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.queued_loads(), 0);

    for _ in 0..1000 {
        let cell = cache.get(&waiting, LoadingStrategy::Budgeted).await.unwrap();
        assert!(!cell.is_valid());
    }
    assert_eq!(cache.queued_loads(), 1);

    wait_until_resident(&cache, &waiting).await;
    assert_eq!(cache.queued_loads(), 0);
    assert_eq!(store.chunk_reads(), 2);
}

// =============================================================================
// Retrieval Strategies
// =============================================================================

#[tokio::test]
async fn test_budgeted_miss_returns_placeholder() {
    let store = five_d_store();
    store.set_delay(Duration::from_millis(20));
    let cache = new_cache(&store);
    let key = cache.cell_key(0, 0, 0, &[0, 0, 0]).await.unwrap();

    let placeholder = cache.get(&key, LoadingStrategy::Budgeted).await.unwrap();
    assert!(!placeholder.is_valid());
    assert_eq!(placeholder.dims(), &[50, 50, 5]);
    assert_eq!(placeholder.kind(), ElementKind::UInt16);
    assert_eq!(placeholder.data().value_range(), Some((0.0, 0.0)));
    assert_eq!(cache.stats().placeholders, 1);

    let cell = wait_until_resident(&cache, &key).await;
    assert_constant(&cell, 7.0);
}

#[tokio::test]
async fn test_blocking_after_budgeted_reads_nothing() {
    let store = five_d_store();
    let cache = new_cache(&store);
    let key = cache.cell_key(0, 1, 0, &[1, 1, 1]).await.unwrap();

    let warmed = wait_until_resident(&cache, &key).await;
    assert_eq!(store.chunk_reads(), 1);

    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(*cell, *warmed);
    assert_constant(&cell, 300.0);
    assert_eq!(store.chunk_reads(), 1);
    assert!(cache.stats().hits >= 1);
}

#[tokio::test]
async fn test_missing_chunk_is_zero_filled() {
    let store = five_d_store();
    let cache = new_cache(&store);
    let key = cache.cell_key(0, 0, 0, &[1, 0, 0]).await.unwrap();
    assert_eq!(five_d_chunk_value("0/0.0.0.0.1"), None);

    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert!(cell.is_valid());
    assert_eq!(cell.dims(), &[50, 50, 5]);
    assert_eq!(cell.num_elements(), 50 * 50 * 5);
    assert_eq!(cell.kind(), ElementKind::UInt16);
    assert_eq!(cell.data().value_range(), Some((0.0, 0.0)));
    assert_eq!(store.chunk_reads(), 1);

    // Zero-filled cells are resident like any other
    cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(store.chunk_reads(), 1);
}

#[tokio::test]
async fn test_declared_fill_value_does_not_change_missing_chunks() {
    let store = planar_store_with_labels();
    let mut attrs = zarray(&[100, 100], &[50, 50], "|u1");
    attrs["fill_value"] = json!(255);
    store.put_json("0/.zarray", attrs);

    let cache = new_cache(&store);
    let key = cache.cell_key(0, 0, 0, &[1, 1]).await.unwrap();
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();

    assert_eq!(cell.kind(), ElementKind::UInt8);
    assert_eq!(cell.data().value_range(), Some((0.0, 0.0)));
}

#[tokio::test]
async fn test_transport_failure_is_zero_filled() {
    let store = five_d_store();
    store.set_failing(true);
    let cache = new_cache(&store);
    let key = cache.cell_key(0, 0, 0, &[0, 0, 0]).await.unwrap();

    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 0.0);
    assert_eq!(cache.stats().storage_reads, 1);
    assert_eq!(cache.stats().bytes_read, 0);

    // The zero cell stays resident until cleared
    store.set_failing(false);
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 0.0);

    cache.clear();
    assert_eq!(cache.resident_cells(), 0);
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 7.0);
    assert_eq!(store.chunk_reads(), 2);
}

#[tokio::test]
async fn test_grid_position_example() {
    let store = five_d_store();
    let cache = new_cache(&store);

    let key = cache.cell_key(1, 2, 0, &[1, 0, 0]).await.unwrap();
    assert_eq!(key.grid_position, vec![2, 1, 0, 0, 1]);
    assert_eq!(key.setup, 1);
    assert_eq!(key.timepoint, 2);

    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 42.0);
    assert_eq!(cell.value_at(&[49, 49, 4]), Some(42.0));
    assert_eq!(cell.value_at(&[50, 0, 0]), None);
}

#[tokio::test]
async fn test_coarser_level_cell() {
    let store = five_d_store();
    let cache = new_cache(&store);

    let key = cache.cell_key(0, 0, 1, &[0, 0, 0]).await.unwrap();
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 9.0);
    assert_eq!(cell.dims(), &[50, 50, 5]);
}

#[tokio::test]
async fn test_planar_cells_are_two_dimensional() {
    let store = planar_store_with_labels();
    let cache = new_cache(&store);

    // Level 1 is smaller than one chunk: the cell is clipped
    let key = cache.cell_key(0, 0, 1, &[0, 0]).await.unwrap();
    assert_eq!(key.grid_position, vec![0, 0]);
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(cell.dims(), &[25, 25]);
    assert_constant(&cell, 2.0);

    // No label chunk was written
    let key = cache.cell_key(1, 0, 0, &[1, 1]).await.unwrap();
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(cell.dims(), &[50, 50]);
    assert_eq!(cell.kind(), ElementKind::UInt32);
    assert_constant(&cell, 0.0);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_then_get_matches_fresh_cache() {
    let store = five_d_store();
    let cache = new_cache(&store);
    let key = cache.cell_key(1, 2, 0, &[1, 0, 0]).await.unwrap();

    let before = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    cache.close();
    assert!(!cache.is_open());
    assert_eq!(cache.resident_cells(), 0);

    let after = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert!(cache.is_open());

    let fresh = new_cache(&store);
    let expected = fresh.get(&key, LoadingStrategy::Blocking).await.unwrap();

    assert_eq!(*after, *expected);
    assert_eq!(*after, *before);
    assert_eq!(store.opens(), 3);
}

#[tokio::test]
async fn test_reopen_reparses_metadata() {
    let store = planar_store_with_labels();
    store.remove("labels/.zattrs");
    let cache = new_cache(&store);
    assert_eq!(cache.setups().await.unwrap().len(), 1);

    store.put_json("labels/.zattrs", json!({ "labels": ["cells"] }));
    assert_eq!(cache.setups().await.unwrap().len(), 1);

    cache.close();
    assert_eq!(cache.setups().await.unwrap().len(), 2);
    assert_eq!(store.opens(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_during_blocking_load() {
    let store = five_d_store();
    store.set_delay(Duration::from_millis(100));
    let cache = Arc::new(new_cache(&store));
    let key = cache.cell_key(0, 0, 0, &[0, 0, 0]).await.unwrap();

    let handle = {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        tokio::spawn(async move { cache.get(&key, LoadingStrategy::Blocking).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.close();

    let cell = handle.await.unwrap().unwrap();
    assert_constant(&cell, 7.0);
}

#[tokio::test]
async fn test_failed_open_is_retried() {
    let store = MemoryStore::new();
    let cache = new_cache(&store);
    assert!(matches!(cache.setups().await, Err(CacheError::Open(_))));
    assert!(!cache.is_open());

    // A failed open leaves the cache closed; the next access tries again
    store.put_json(
        ".zattrs",
        multiscales(None, &["y", "x"], json!([{"path": "0"}])),
    );
    store.put_json("0/.zarray", zarray(&[10, 10], &[10, 10], "|u1"));
    store.put("0/0.0", vec![5u8; 100]);

    let key = cache.cell_key(0, 0, 0, &[0, 0]).await.unwrap();
    let cell = cache.get(&key, LoadingStrategy::Blocking).await.unwrap();
    assert_constant(&cell, 5.0);
    assert_eq!(store.opens(), 2);
}

// =============================================================================
// Key Validation and Bounds
// =============================================================================

#[tokio::test]
async fn test_invalid_keys_are_rejected() {
    let store = five_d_store();
    let cache = new_cache(&store);

    let key = |setup, timepoint, level, grid_position: &[u64]| ChunkKey {
        setup,
        timepoint,
        level,
        grid_position: grid_position.to_vec(),
    };

    let result = cache
        .get(&key(5, 0, 0, &[0, 0, 0, 0, 0]), LoadingStrategy::Blocking)
        .await;
    assert!(matches!(result, Err(CacheError::UnknownSetup(5))));

    let result = cache
        .get(&key(0, 0, 2, &[0, 0, 0, 0, 0]), LoadingStrategy::Budgeted)
        .await;
    assert!(matches!(
        result,
        Err(CacheError::InvalidLevel { setup: 0, level: 2 })
    ));

    let result = cache
        .get(&key(0, 3, 0, &[3, 0, 0, 0, 0]), LoadingStrategy::Blocking)
        .await;
    assert!(matches!(
        result,
        Err(CacheError::InvalidTimepoint { setup: 0, timepoint: 3 })
    ));

    // Outside the chunk grid
    let result = cache
        .get(&key(0, 0, 0, &[0, 0, 0, 0, 2]), LoadingStrategy::Blocking)
        .await;
    assert!(matches!(result, Err(CacheError::InvalidGridPosition(_))));

    // Channel coordinate of another setup
    let result = cache
        .get(&key(0, 0, 0, &[0, 1, 0, 0, 0]), LoadingStrategy::Blocking)
        .await;
    assert!(matches!(result, Err(CacheError::InvalidGridPosition(_))));

    // Wrong rank
    let result = cache
        .get(&key(0, 0, 0, &[0, 0]), LoadingStrategy::Blocking)
        .await;
    assert!(matches!(result, Err(CacheError::InvalidGridPosition(_))));

    assert!(matches!(
        cache.cell_key(0, 0, 4, &[0, 0, 0]).await,
        Err(CacheError::InvalidLevel { .. })
    ));
    assert_eq!(store.chunk_reads(), 0);
}

#[tokio::test]
async fn test_resident_cells_are_bounded() {
    let store = five_d_store();
    let cache = CellCache::new(
        store.source(),
        CacheConfig::new()
            .with_fetcher_threads(1)
            .with_max_resident_cells(2),
    );

    let mut keys = Vec::new();
    for x in 0..3 {
        keys.push(cache.cell_key(0, 0, 0, &[x % 2, x / 2, 0]).await.unwrap());
    }
    for key in &keys {
        cache.get(key, LoadingStrategy::Blocking).await.unwrap();
    }
    assert_eq!(cache.resident_cells(), 2);
    assert_eq!(store.chunk_reads(), 3);

    // The least recently used cell was evicted
    cache.get(&keys[0], LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(store.chunk_reads(), 4);
    cache.get(&keys[2], LoadingStrategy::Blocking).await.unwrap();
    assert_eq!(store.chunk_reads(), 4);
}
