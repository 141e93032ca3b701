//! Test utilities for integration tests.
//!
//! This module provides an in-memory object store that tracks chunk reads,
//! and helpers for writing small OME-Zarr containers into it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ome_zarr_cache::error::IoError;
use ome_zarr_cache::io::{ObjectStore, StoreSource};

// =============================================================================
// In-memory Object Store with Request Tracking
// =============================================================================

#[derive(Default)]
struct MemoryState {
    objects: RwLock<HashMap<String, Bytes>>,
    chunk_reads: AtomicUsize,
    opens: AtomicUsize,
    fail_chunks: AtomicBool,
    delay_ms: AtomicU64,
}

/// An in-memory store that counts chunk reads.
///
/// Clones share the same objects and counters. Reads of `.zattrs` and
/// `.zarray` are metadata reads and are not counted.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, data: impl Into<Bytes>) {
        self.state.objects.write().insert(key.to_string(), data.into());
    }

    pub fn put_json(&self, key: &str, value: Value) {
        self.put(key, value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.state.objects.write().remove(key);
    }

    /// Number of chunk reads issued so far.
    pub fn chunk_reads(&self) -> usize {
        self.state.chunk_reads.load(Ordering::SeqCst)
    }

    /// Number of times a cache opened this store.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Make every chunk read fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.state.fail_chunks.store(failing, Ordering::SeqCst);
    }

    /// Delay every chunk read.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn source(&self) -> MemorySource {
        MemorySource {
            store: self.clone(),
        }
    }
}

fn is_metadata_key(key: &str) -> bool {
    key.ends_with(".zattrs") || key.ends_with(".zarray") || key.ends_with(".zgroup")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, IoError> {
        if !is_metadata_key(key) {
            self.state.chunk_reads.fetch_add(1, Ordering::SeqCst);

            let delay = self.state.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            if self.state.fail_chunks.load(Ordering::SeqCst) {
                return Err(IoError::Connection(format!("{}: connection reset", key)));
            }
        }

        Ok(self.state.objects.read().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, IoError> {
        let prefix = prefix.trim_matches('/');
        let objects = self.state.objects.read();

        let children: BTreeSet<String> = objects
            .keys()
            .filter_map(|key| {
                if prefix.is_empty() {
                    Some(key.as_str())
                } else {
                    key.strip_prefix(prefix)?.strip_prefix('/')
                }
            })
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Ok(children.into_iter().collect())
    }

    fn location(&self) -> String {
        "memory://test.ome.zarr".to_string()
    }
}

/// `StoreSource` over a shared `MemoryStore`.
#[derive(Clone)]
pub struct MemorySource {
    store: MemoryStore,
}

#[async_trait]
impl StoreSource for MemorySource {
    type Store = MemoryStore;

    async fn open_store(&self) -> Result<Self::Store, IoError> {
        self.store.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

// =============================================================================
// Container Fixtures
// =============================================================================

/// A `.zarray` document for an uncompressed C-order array.
pub fn zarray(shape: &[u64], chunks: &[u64], dtype: &str) -> Value {
    json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dtype,
        "compressor": null,
        "fill_value": 0,
        "order": "C",
        "filters": null
    })
}

/// A `.zattrs` document with one multiscale entry.
pub fn multiscales(name: Option<&str>, axes: &[&str], datasets: Value) -> Value {
    let mut multiscale = json!({
        "version": "0.4",
        "axes": axes,
        "datasets": datasets
    });
    if let Some(name) = name {
        multiscale["name"] = json!(name);
    }
    json!({ "multiscales": [multiscale] })
}

/// Little-endian u16 chunk bytes where every element is `value`.
pub fn constant_u16_chunk(num_elements: usize, value: u16) -> Vec<u8> {
    std::iter::repeat(value)
        .take(num_elements)
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

/// Elements in one chunk of the 5D fixture.
pub const FIVE_D_CHUNK_ELEMENTS: usize = 5 * 50 * 50;

/// A `tczyx` image with two pyramid levels:
///
/// - level 0: shape `[3, 2, 10, 100, 100]`, chunks `[1, 1, 5, 50, 50]`
/// - level 1: shape `[3, 2, 5, 50, 50]`, chunks `[1, 1, 5, 50, 50]`
///
/// Only a few chunks exist; see [`five_d_chunk_value`].
pub fn five_d_store() -> MemoryStore {
    let store = MemoryStore::new();

    store.put_json(
        ".zattrs",
        multiscales(
            Some("embryo"),
            &["t", "c", "z", "y", "x"],
            json!([
                {
                    "path": "0",
                    "coordinateTransformations": [
                        {"type": "scale", "scale": [1.0, 1.0, 2.0, 0.5, 0.5]},
                        {"type": "translation", "translation": [0.0, 0.0, 0.0, 10.0, 20.0]}
                    ]
                },
                {
                    "path": "1",
                    "coordinateTransformations": [
                        {"type": "scale", "scale": [1.0, 1.0, 4.0, 1.0, 1.0]},
                        {"type": "translation", "translation": [0.0, 0.0, 0.0, 10.0, 20.0]}
                    ]
                }
            ]),
        ),
    );
    store.put_json("0/.zarray", zarray(&[3, 2, 10, 100, 100], &[1, 1, 5, 50, 50], "<u2"));
    store.put_json("1/.zarray", zarray(&[3, 2, 5, 50, 50], &[1, 1, 5, 50, 50], "<u2"));

    for (key, value) in FIVE_D_CHUNKS {
        store.put(key, constant_u16_chunk(FIVE_D_CHUNK_ELEMENTS, *value));
    }

    store
}

/// Chunks present in [`five_d_store`] and their constant values.
pub const FIVE_D_CHUNKS: &[(&str, u16)] = &[
    ("0/0.0.0.0.0", 7),
    ("0/2.1.0.0.1", 42),
    ("0/1.0.1.1.1", 300),
    ("1/0.0.0.0.0", 9),
];

/// Constant value of a chunk of [`five_d_store`], if it exists.
pub fn five_d_chunk_value(key: &str) -> Option<u16> {
    FIVE_D_CHUNKS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

/// A planar `yx` image (`[100, 100]` at level 0, `[25, 25]` at level 1)
/// plus one label image under `labels/cells`.
pub fn planar_store_with_labels() -> MemoryStore {
    let store = MemoryStore::new();

    store.put_json(
        ".zattrs",
        multiscales(
            None,
            &["y", "x"],
            json!([{"path": "0"}, {"path": "1"}]),
        ),
    );
    store.put_json("0/.zarray", zarray(&[100, 100], &[50, 50], "|u1"));
    store.put_json("1/.zarray", zarray(&[25, 25], &[50, 50], "|u1"));
    store.put("0/0.0", vec![1u8; 50 * 50]);
    store.put("1/0.0", vec![2u8; 50 * 50]);

    store.put_json("labels/.zattrs", json!({ "labels": ["cells"] }));
    store.put_json(
        "labels/cells/.zattrs",
        multiscales(Some("cells"), &["y", "x"], json!([{"path": "0"}])),
    );
    store.put_json("labels/cells/0/.zarray", zarray(&[100, 100], &[50, 50], "<u4"));

    store
}
