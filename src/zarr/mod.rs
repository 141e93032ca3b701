//! Zarr v2 array access.
//!
//! Parses `.zarray`/`.zattrs` documents and reads chunks through an
//! [`ObjectStore`](crate::io::ObjectStore), delegating decompression to the
//! codec named in the array metadata.

mod compression;
mod metadata;
mod reader;

pub use compression::Compressor;
pub use metadata::{parse_dtype, ByteOrder, DatasetAttributes, ElementKind};
pub use reader::{chunk_key, ZarrReader};
