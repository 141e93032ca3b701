use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::{FormatError, IoError};

/// Chunk compressors with a decode step available in this crate.
///
/// The compressor is resolved from `.zarray` when a level is opened; an
/// unknown codec id fails the setup rather than every chunk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Zlib,
    Gzip,
    Zstd,
}

impl Compressor {
    /// Resolve a numcodecs compressor id (`None` for an uncompressed array).
    pub fn from_id(id: Option<&str>) -> Result<Self, FormatError> {
        match id {
            None => Ok(Compressor::None),
            Some("zlib") => Ok(Compressor::Zlib),
            Some("gzip") => Ok(Compressor::Gzip),
            Some("zstd") => Ok(Compressor::Zstd),
            Some(other) => Err(FormatError::UnsupportedCompressor(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Zlib => "zlib",
            Compressor::Gzip => "gzip",
            Compressor::Zstd => "zstd",
        }
    }

    /// Decompress one stored chunk.
    ///
    /// `expected_size` is a capacity hint (the nominal chunk size in bytes).
    pub fn decompress(&self, data: Bytes, expected_size: usize) -> Result<Bytes, IoError> {
        match self {
            Compressor::None => Ok(data),
            Compressor::Zlib => read_all(ZlibDecoder::new(&data[..]), expected_size),
            Compressor::Gzip => read_all(GzDecoder::new(&data[..]), expected_size),
            Compressor::Zstd => zstd::stream::decode_all(&data[..])
                .map(Bytes::from)
                .map_err(|e| IoError::Decode(format!("zstd: {}", e))),
        }
    }
}

fn read_all(mut decoder: impl Read, expected_size: usize) -> Result<Bytes, IoError> {
    let mut decompressed = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| IoError::Decode(e.to_string()))?;
    Ok(Bytes::from(decompressed))
}
