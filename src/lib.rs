//! # OME-Zarr Cache
//!
//! A chunked, multi-resolution cell cache for OME-Zarr images stored on a
//! local filesystem or in S3-compatible object storage.
//!
//! The library resolves the pyramid and axis metadata of a container,
//! translates (setup, timepoint, level, spatial grid position) requests into
//! Zarr chunk reads, decodes chunks into typed arrays and keeps them in a
//! concurrent cache with two retrieval strategies:
//!
//! - **Blocking**: wait until the cell is loaded
//! - **Budgeted**: never wait; queue the load and get a placeholder
//!
//! ## Architecture
//!
//! - [`io`] - Object stores (filesystem, S3) and store sources
//! - [`zarr`] - Zarr v2 metadata and chunk reads
//! - [`ome`] - Axes, multiscale pyramids and setups
//! - [`cell`] - Chunk fetcher, typed cells and the cell cache
//! - [`config`] - Cache configuration and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ome_zarr_cache::{CacheConfig, CellCache, FilesystemSource, LoadingStrategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ome_zarr_cache::CacheError> {
//!     let source = FilesystemSource::new("data/sample.ome.zarr");
//!     let cache = CellCache::new(source, CacheConfig::new());
//!
//!     let key = cache.cell_key(0, 0, 0, &[0, 0, 0]).await?;
//!     let cell = cache.get(&key, LoadingStrategy::Blocking).await?;
//!     println!("{:?} {:?}", cell.dims(), cell.data().value_range());
//!     Ok(())
//! }
//! ```

pub mod cell;
pub mod config;
pub mod error;
pub mod io;
pub mod ome;
pub mod zarr;

// Re-export commonly used types
pub use cell::{
    CacheStats, CellCache, CellData, CellGeometry, ChunkFetcher, ChunkKey, LoadingStrategy,
    TypedCell,
};
pub use config::{CacheConfig, Cli, Command, FetchConfig, InspectConfig, Location, StoreArgs};
pub use error::{CacheError, CacheStateError, FormatError, IoError};
pub use io::{
    create_s3_client, join_key, FilesystemSource, FilesystemStore, ObjectStore, S3Source, S3Store,
    StoreSource,
};
pub use ome::{
    resolution_factors, AxisDescriptor, AxisTag, Container, LevelTransform, MultiscaleMetadata,
    MultiscaleMetadataResolver, PyramidLevel, PyramidSetup,
};
pub use zarr::{ByteOrder, Compressor, DatasetAttributes, ElementKind, ZarrReader};
