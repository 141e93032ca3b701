use thiserror::Error;

/// I/O errors that can occur when reading from a storage backend.
///
/// These never cross the chunk fetch boundary: the fetcher logs them and
/// degrades the read to a missing chunk.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Chunk bytes could not be decompressed or decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::Io(err.to_string())
    }
}

/// Errors raised while resolving OME-Zarr metadata for a setup.
///
/// A format error is fatal to opening the setup it concerns, but sibling
/// setups of the same container are still opened.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading metadata
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The group has no `multiscales` attribute
    #[error("Could not find multiscales at {location}")]
    MissingMultiscales { location: String },

    /// Axis tags are unknown, duplicated, or of the wrong count
    #[error("Invalid axes: {0}")]
    InvalidAxes(String),

    /// A pyramid level has no `.zarray`
    #[error("Missing dataset attributes for '{path}' at {location}")]
    MissingDatasetAttributes { location: String, path: String },

    /// A pyramid level has a malformed `.zarray` or multiscale entry
    #[error("Invalid dataset attributes for '{path}': {reason}")]
    InvalidDatasetAttributes { path: String, reason: String },

    /// The element type is outside the supported numeric kinds
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// The chunk compressor has no decoder in this crate
    #[error("Unsupported compressor: {0}")]
    UnsupportedCompressor(String),
}

/// Internal cache bookkeeping violations.
///
/// These indicate a programming defect rather than a recoverable condition;
/// see [`report_state_error`].
#[derive(Debug, Clone, Error)]
pub enum CacheStateError {
    /// A fetch completed for a key that was already resident
    #[error("Chunk {0} completed a load while already resident")]
    DuplicateResident(String),

    /// A fetch completed for a key with no matching pending request
    #[error("Chunk {0} completed a load without a pending request")]
    MissingPending(String),
}

/// Fail loudly in debug builds, log in release builds.
pub(crate) fn report_state_error(err: CacheStateError) {
    tracing::error!("cache state violation: {}", err);
    debug_assert!(false, "cache state violation: {}", err);
}

/// Errors returned by the cell cache.
///
/// Missing chunks and transport failures are not errors at this level; they
/// resolve to zero-filled cells.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The container could not be opened
    #[error("Failed to open container: {0}")]
    Open(#[from] FormatError),

    /// No setup with this id
    #[error("Unknown setup: {0}")]
    UnknownSetup(usize),

    /// The setup has no such pyramid level
    #[error("Invalid level {level} for setup {setup}")]
    InvalidLevel { setup: usize, level: usize },

    /// The setup has no such timepoint
    #[error("Invalid timepoint {timepoint} for setup {setup}")]
    InvalidTimepoint { setup: usize, timepoint: u64 },

    /// The grid position does not address a cell of the level
    #[error("Invalid grid position: {0}")]
    InvalidGridPosition(String),
}
