//! Configuration for the cell cache and the diagnostic binary.
//!
//! The library is configured with [`CacheConfig`], a plain builder. The
//! binary parses its arguments with clap; every option can also be set via
//! an environment variable with the `OZC_` prefix:
//!
//! - `OZC_LOCATION` - Container location (directory or `s3://bucket/prefix`)
//! - `OZC_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `OZC_S3_REGION` - AWS region (default: us-east-1)
//! - `OZC_FETCHER_THREADS` - Number of fetch workers (default: available parallelism)
//! - `OZC_MAX_CELLS` - Maximum number of resident cells (default: unbounded)
//! - `OZC_MULTISCALE` - Name of the multiscale to use when a group declares several
//! - `OZC_LOG_FETCHES` - Log every chunk read (default: false)

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

// =============================================================================
// Default Values
// =============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

// =============================================================================
// Library Configuration
// =============================================================================

/// Configuration of a [`CellCache`](crate::CellCache).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of fetch workers; `None` uses the available parallelism.
    pub fetcher_threads: Option<usize>,

    /// Upper bound on resident cells (least recently used are evicted);
    /// `None` keeps every cell until `clear()` or `close()`.
    pub max_resident_cells: Option<NonZeroUsize>,

    /// Log timing and size of every chunk read.
    pub log_fetches: bool,

    /// Multiscale to use when a group declares several.
    pub preferred_multiscale: Option<String>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher_threads(mut self, threads: usize) -> Self {
        self.fetcher_threads = Some(threads);
        self
    }

    /// Bound the number of resident cells; 0 means unbounded.
    pub fn with_max_resident_cells(mut self, cells: usize) -> Self {
        self.max_resident_cells = NonZeroUsize::new(cells);
        self
    }

    pub fn with_fetch_logging(mut self, enabled: bool) -> Self {
        self.log_fetches = enabled;
        self
    }

    pub fn with_preferred_multiscale(mut self, name: impl Into<String>) -> Self {
        self.preferred_multiscale = Some(name.into());
        self
    }

    /// Effective number of fetch workers, at least 1.
    pub fn worker_count(&self) -> usize {
        self.fetcher_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
            .max(1)
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// OME-Zarr Cache - inspect and read chunked multi-resolution images.
#[derive(Parser, Debug, Clone)]
#[command(name = "ome-zarr-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the setups, pyramid levels and transforms of a container.
    Inspect(InspectConfig),

    /// Load one cell and print its shape and value range.
    Fetch(FetchConfig),
}

/// Where a container lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Container directory on the local filesystem.
    Filesystem(PathBuf),

    /// Container below `prefix` in an S3 bucket.
    S3 { bucket: String, prefix: String },
}

impl Location {
    /// Parse a directory path, `file://` URL or `s3://bucket/prefix` URL.
    pub fn parse(location: &str) -> Result<Self, String> {
        if location.is_empty() {
            return Err("Container location is required. Set it as argument or OZC_LOCATION".to_string());
        }

        if !location.contains("://") {
            return Ok(Location::Filesystem(PathBuf::from(location)));
        }

        let url = Url::parse(location).map_err(|e| format!("Invalid location '{}': {}", location, e))?;
        match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| format!("No bucket in '{}'", location))?;
                Ok(Location::S3 {
                    bucket: bucket.to_string(),
                    prefix: url.path().trim_matches('/').to_string(),
                })
            }
            "file" => url
                .to_file_path()
                .map(Location::Filesystem)
                .map_err(|_| format!("Invalid file URL '{}'", location)),
            other => Err(format!("Unsupported location scheme '{}'", other)),
        }
    }
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Container location: a directory or `s3://bucket/prefix`.
    #[arg(env = "OZC_LOCATION")]
    pub location: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "OZC_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "OZC_S3_REGION")]
    pub s3_region: String,

    /// Number of fetch workers (default: available parallelism).
    #[arg(long, env = "OZC_FETCHER_THREADS")]
    pub fetcher_threads: Option<usize>,

    /// Maximum number of resident cells (0 = unbounded).
    #[arg(long, default_value_t = 0, env = "OZC_MAX_CELLS")]
    pub max_cells: usize,

    /// Multiscale to use when a group declares several.
    #[arg(long, env = "OZC_MULTISCALE")]
    pub multiscale: Option<String>,

    /// Log every chunk read with its size and throughput.
    #[arg(long, default_value_t = false, env = "OZC_LOG_FETCHES")]
    pub log_fetches: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl StoreArgs {
    /// Validate the options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        let location = Location::parse(&self.location)?;

        if self.fetcher_threads == Some(0) {
            return Err("fetcher_threads must be greater than 0".to_string());
        }

        if self.s3_endpoint.is_some() && !matches!(location, Location::S3 { .. }) {
            return Err("--s3-endpoint only applies to s3:// locations".to_string());
        }

        Ok(())
    }

    pub fn parsed_location(&self) -> Result<Location, String> {
        Location::parse(&self.location)
    }

    /// Cache configuration derived from the options.
    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new()
            .with_max_resident_cells(self.max_cells)
            .with_fetch_logging(self.log_fetches);
        if let Some(threads) = self.fetcher_threads {
            config = config.with_fetcher_threads(threads);
        }
        if let Some(ref name) = self.multiscale {
            config = config.with_preferred_multiscale(name.clone());
        }
        config
    }
}

/// Options of the `inspect` command.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    #[command(flatten)]
    pub store: StoreArgs,
}

/// Options of the `fetch` command.
#[derive(Args, Debug, Clone)]
pub struct FetchConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Setup id.
    #[arg(long, default_value_t = 0)]
    pub setup: usize,

    /// Pyramid level (0 = full resolution).
    #[arg(long, default_value_t = 0)]
    pub level: usize,

    /// Timepoint.
    #[arg(long, default_value_t = 0)]
    pub timepoint: u64,

    /// Cell grid position along x.
    #[arg(long, default_value_t = 0)]
    pub x: u64,

    /// Cell grid position along y.
    #[arg(long, default_value_t = 0)]
    pub y: u64,

    /// Cell grid position along z.
    #[arg(long, default_value_t = 0)]
    pub z: u64,
}

impl FetchConfig {
    /// Spatial grid position (`x, y, z`).
    pub fn grid_position(&self) -> [u64; 3] {
        [self.x, self.y, self.z]
    }
}

// =============================================================================
// Tests
// =============================================================================
