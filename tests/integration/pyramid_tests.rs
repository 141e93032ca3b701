//! Metadata and setup integration tests.
//!
//! Tests verify:
//! - Setup enumeration (image channels, then labels)
//! - Resolution factors and level transforms
//! - Format errors carry the storage location and only affect their setup
//! - Multiscale selection and the `tczyx` axes default

use serde_json::json;

use ome_zarr_cache::{
    resolution_factors, AxisTag, CacheConfig, CacheError, CellCache, ElementKind, FormatError,
};

use super::test_utils::{
    five_d_store, multiscales, planar_store_with_labels, zarray, MemoryStore,
};

// =============================================================================
// Setup Enumeration
// =============================================================================

#[tokio::test]
async fn test_one_setup_per_channel() {
    let cache = CellCache::new(five_d_store().source(), CacheConfig::new());

    let setups = cache.setups().await.unwrap();
    assert_eq!(setups.len(), 2);

    for (id, setup) in setups.iter().enumerate() {
        assert_eq!(setup.id(), id);
        assert_eq!(setup.channel(), id as u64);
        assert_eq!(setup.name(), "embryo");
        assert_eq!(setup.group(), "");
        assert!(!setup.is_label());
        assert_eq!(setup.kind(), ElementKind::UInt16);
        assert_eq!(setup.num_timepoints(), 3);
        assert_eq!(setup.num_levels(), 2);
        assert_eq!(setup.axes().to_string(), "tczyx");
    }

    assert_eq!(cache.num_timepoints().await.unwrap(), 3);
}

#[tokio::test]
async fn test_labels_follow_image_setups() {
    let cache = CellCache::new(planar_store_with_labels().source(), CacheConfig::new());

    let setups = cache.setups().await.unwrap();
    assert_eq!(setups.len(), 2);

    let image = &setups[0];
    assert_eq!(image.name(), "image 0");
    assert!(!image.is_label());
    assert!(image.axes().is_planar());
    assert_eq!(image.kind(), ElementKind::UInt8);

    let label = &setups[1];
    assert_eq!(label.id(), 1);
    assert_eq!(label.name(), "cells");
    assert_eq!(label.group(), "labels/cells");
    assert!(label.is_label());
    assert_eq!(label.channel(), 0);
    assert_eq!(label.kind(), ElementKind::UInt32);
    assert_eq!(label.num_timepoints(), 1);
}

#[tokio::test]
async fn test_broken_label_does_not_abort_siblings() {
    let store = planar_store_with_labels();
    store.put_json("labels/.zattrs", json!({ "labels": ["ghost", "cells"] }));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    let setups = cache.setups().await.unwrap();

    assert_eq!(setups.len(), 2);
    assert_eq!(setups[1].name(), "cells");
    assert_eq!(setups[1].id(), 1);
}

#[tokio::test]
async fn test_missing_multiscales_reports_location() {
    let store = MemoryStore::new();
    store.put_json("0/.zarray", zarray(&[10, 10], &[5, 5], "|u1"));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    match cache.setups().await {
        Err(CacheError::Open(FormatError::MissingMultiscales { location })) => {
            assert!(location.contains("memory://test.ome.zarr"));
            assert!(location.contains("multiscales"));
        }
        other => panic!("expected missing multiscales, got {:?}", other.map(|s| s.len())),
    }
    assert!(!cache.is_open());
}

#[tokio::test]
async fn test_missing_level_attributes_is_format_error() {
    let store = planar_store_with_labels();
    store.remove("1/.zarray");
    store.remove("labels/.zattrs");

    let cache = CellCache::new(store.source(), CacheConfig::new());
    match cache.setups().await {
        Err(CacheError::Open(FormatError::MissingDatasetAttributes { location, path })) => {
            assert_eq!(path, "1");
            assert!(location.contains("memory://"));
        }
        other => panic!("expected missing dataset attributes, got {:?}", other.map(|s| s.len())),
    }
}

#[tokio::test]
async fn test_element_kind_mismatch_skips_only_that_setup() {
    let store = planar_store_with_labels();
    store.put_json("0/.zarray", zarray(&[100, 100], &[50, 50], "<u2"));
    store.put_json("1/.zarray", zarray(&[25, 25], &[50, 50], "|u1"));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    let setups = cache.setups().await.unwrap();

    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].id(), 0);
    assert_eq!(setups[0].name(), "cells");
    assert!(setups[0].is_label());

    store.remove("labels/.zattrs");
    cache.close();
    match cache.setups().await {
        Err(CacheError::Open(FormatError::InvalidDatasetAttributes { path, reason })) => {
            assert_eq!(path, "1");
            assert!(reason.contains("differs from level 0"));
        }
        other => panic!("expected a kind mismatch, got {:?}", other.map(|s| s.len())),
    }
}

#[tokio::test]
async fn test_unsupported_compressor_is_format_error() {
    let store = MemoryStore::new();
    store.put_json(
        ".zattrs",
        multiscales(None, &["y", "x"], json!([{"path": "0"}])),
    );
    let mut attrs = zarray(&[10, 10], &[5, 5], "<u2");
    attrs["compressor"] = json!({"id": "blosc", "cname": "lz4"});
    store.put_json("0/.zarray", attrs);

    let cache = CellCache::new(store.source(), CacheConfig::new());
    assert!(matches!(
        cache.setups().await,
        Err(CacheError::Open(FormatError::UnsupportedCompressor(_)))
    ));
}

#[tokio::test]
async fn test_axis_count_mismatch_is_format_error() {
    let store = MemoryStore::new();
    store.put_json(
        ".zattrs",
        multiscales(None, &["z", "y", "x"], json!([{"path": "0"}])),
    );
    store.put_json("0/.zarray", zarray(&[10, 10], &[5, 5], "|u1"));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    assert!(matches!(
        cache.setups().await,
        Err(CacheError::Open(FormatError::InvalidAxes(_)))
    ));
}

// =============================================================================
// Multiscale Selection
// =============================================================================

fn two_multiscales_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.put_json(
        ".zattrs",
        json!({
            "multiscales": [
                {"name": "raw", "axes": ["y", "x"], "datasets": [{"path": "raw/0"}]},
                {"name": "max", "axes": ["y", "x"], "datasets": [{"path": "max/0"}, {"path": "max/1"}]}
            ]
        }),
    );
    store.put_json("raw/0/.zarray", zarray(&[64, 64], &[32, 32], "|u1"));
    store.put_json("max/0/.zarray", zarray(&[64, 64], &[32, 32], "<f4"));
    store.put_json("max/1/.zarray", zarray(&[32, 32], &[32, 32], "<f4"));
    store
}

#[tokio::test]
async fn test_first_multiscale_by_default() {
    let cache = CellCache::new(two_multiscales_store().source(), CacheConfig::new());
    let setup = cache.setup(0).await.unwrap();

    assert_eq!(setup.name(), "raw");
    assert_eq!(setup.num_levels(), 1);
    assert_eq!(setup.kind(), ElementKind::UInt8);
}

#[tokio::test]
async fn test_preferred_multiscale_is_selected() {
    let config = CacheConfig::new().with_preferred_multiscale("max");
    let cache = CellCache::new(two_multiscales_store().source(), config);
    let setup = cache.setup(0).await.unwrap();

    assert_eq!(setup.name(), "max");
    assert_eq!(setup.num_levels(), 2);
    assert_eq!(setup.kind(), ElementKind::Float32);
    assert_eq!(setup.level(1).unwrap().path(), "max/1");
}

#[tokio::test]
async fn test_axes_default_to_tczyx() {
    let store = MemoryStore::new();
    store.put_json(
        ".zattrs",
        json!({ "multiscales": [{"datasets": [{"path": "0"}]}] }),
    );
    store.put_json("0/.zarray", zarray(&[2, 1, 4, 8, 8], &[1, 1, 4, 8, 8], "<i2"));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    let setup = cache.setup(0).await.unwrap();

    assert_eq!(setup.axes().to_string(), "tczyx");
    assert_eq!(setup.num_timepoints(), 2);
    assert_eq!(setup.kind(), ElementKind::Int16);
}

#[tokio::test]
async fn test_axis_objects_carry_units() {
    let store = MemoryStore::new();
    store.put_json(
        ".zattrs",
        json!({
            "multiscales": [{
                "axes": [
                    {"name": "z", "type": "space", "unit": "micrometer"},
                    {"name": "y", "type": "space", "unit": "micrometer"},
                    {"name": "x", "type": "space", "unit": "micrometer"}
                ],
                "datasets": [{"path": "s0"}]
            }]
        }),
    );
    store.put_json("s0/.zarray", zarray(&[4, 8, 8], &[4, 8, 8], "<f8"));

    let cache = CellCache::new(store.source(), CacheConfig::new());
    let setup = cache.setup(0).await.unwrap();

    assert!(setup.axes().has_z_axis());
    assert_eq!(setup.unit(), Some("micrometer"));
    assert_eq!(setup.spatial_image_size(0), Some([8, 8, 4]));
}

// =============================================================================
// Resolutions and Transforms
// =============================================================================

#[test]
fn test_resolution_factor() {
    assert_eq!(resolution_factors(&[100, 100], &[25, 25]), vec![4.0, 4.0]);
}

#[tokio::test]
async fn test_planar_mipmap_resolutions() {
    let cache = CellCache::new(planar_store_with_labels().source(), CacheConfig::new());
    let setup = cache.setup(0).await.unwrap();

    assert_eq!(
        setup.mipmap_resolutions(),
        vec![[1.0, 1.0, 1.0], [4.0, 4.0, 1.0]]
    );
    assert_eq!(setup.grid_size(0), Some([2, 2, 1]));
    assert_eq!(setup.grid_size(1), Some([1, 1, 1]));
}

#[tokio::test]
async fn test_level_transforms() {
    let cache = CellCache::new(five_d_store().source(), CacheConfig::new());
    let setup = cache.setup(0).await.unwrap();

    let level0 = setup.level_transform(0).unwrap();
    assert_eq!(level0.scale, [0.5, 0.5, 2.0]);
    assert_eq!(level0.translation, [20.0, 10.0, 0.0]);
    assert_eq!(level0.apply([2.0, 4.0, 1.0]), [21.0, 12.0, 2.0]);

    let level1 = setup.level_transform(1).unwrap();
    assert_eq!(level1.scale, [2.0, 2.0, 2.0]);
    assert_eq!(level1.translation, [20.0, 10.0, 0.0]);

    assert_eq!(setup.voxel_size(), [0.5, 0.5, 2.0]);
    assert_eq!(setup.chunk_shape(0), Some([50, 50, 5]));
    assert_eq!(setup.grid_size(0), Some([2, 2, 2]));
    assert!(setup.level_transform(2).is_none());
    assert_eq!(setup.axes().declared_index(AxisTag::C), Some(1));
}
