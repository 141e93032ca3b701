//! Decoded cells and the cache serving them.
//!
//! - [`ChunkFetcher`] reads one chunk and never fails
//! - [`TypedCell`] holds the decoded values of one chunk
//! - [`CellCache`] deduplicates, queues and keeps cells

mod array;
mod cache;
mod fetcher;
mod queue;

pub use array::{CellData, CellGeometry, TypedCell};
pub use cache::{CacheStats, CellCache, ChunkKey, LoadingStrategy};
pub use fetcher::ChunkFetcher;
