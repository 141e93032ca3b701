//! OME-Zarr Cache - diagnostic command line.
//!
//! `inspect` prints the setups and pyramid of a container, `fetch` loads one
//! cell through the cache.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ome_zarr_cache::{
    config::{Cli, Command, FetchConfig, InspectConfig, Location, StoreArgs},
    create_s3_client, CellCache, FilesystemSource, LoadingStrategy, S3Source, StoreSource,
};

/// Bind `$cache` to a cache over the configured location and evaluate
/// `$body`.
macro_rules! with_cache {
    ($args:expr, |$cache:ident| $body:expr) => {{
        let args: &StoreArgs = $args;
        match args.parsed_location() {
            Err(e) => {
                error!("Configuration error: {}", e);
                ExitCode::FAILURE
            }
            Ok(Location::Filesystem(path)) => {
                let $cache = CellCache::new(FilesystemSource::new(path), args.cache_config());
                $body
            }
            Ok(Location::S3 { bucket, prefix }) => {
                let client = create_s3_client(args.s3_endpoint.as_deref(), &args.s3_region).await;
                let source = S3Source::new(client, bucket, prefix)
                    .with_endpoint(args.s3_endpoint.clone());
                let $cache = CellCache::new(source, args.cache_config());
                $body
            }
        }
    }};
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Inspect(config) => run_inspect(config).await,
        Command::Fetch(config) => run_fetch(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "ome_zarr_cache=debug"
    } else {
        "ome_zarr_cache=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn check_config(args: &StoreArgs) -> bool {
    init_logging(args.verbose);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        return false;
    }
    true
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(config: InspectConfig) -> ExitCode {
    if !check_config(&config.store) {
        return ExitCode::FAILURE;
    }

    println!("Container: {}", config.store.location);
    with_cache!(&config.store, |cache| inspect(&cache).await)
}

async fn inspect<S: StoreSource + 'static>(cache: &CellCache<S>) -> ExitCode {
    let setups = match cache.setups().await {
        Ok(setups) => setups,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("═════════════════════════════════");
    for setup in &setups {
        println!(
            "Setup {}: {}{}",
            setup.id(),
            setup.name(),
            if setup.is_label() { " (label)" } else { "" }
        );
        println!(
            "  group: /{}  channel: {}  axes: {}  type: {}  timepoints: {}",
            setup.group(),
            setup.channel(),
            setup.axes(),
            setup.kind().name(),
            setup.num_timepoints()
        );
        let voxel = setup.voxel_size();
        println!(
            "  voxel size: {} x {} x {} {}",
            voxel[0],
            voxel[1],
            voxel[2],
            setup.unit().unwrap_or("(no unit)")
        );

        for level in setup.levels() {
            let index = level.index();
            let attrs = level.attributes();
            println!(
                "  level {} [{}]: shape {:?}, chunks {:?}, {}",
                index,
                level.path(),
                level.dimensions(),
                level.chunk_shape(),
                attrs.compressor().name()
            );
            if let (Some(size), Some(grid), Some(transform)) = (
                setup.spatial_image_size(index),
                setup.grid_size(index),
                setup.level_transform(index),
            ) {
                println!(
                    "    xyz size {:?}, cell grid {:?}, scale {:?}, translation {:?}",
                    size, grid, transform.scale, transform.translation
                );
            }
        }
    }
    println!("═════════════════════════════════");
    println!("{} setup(s)", setups.len());

    cache.close();
    ExitCode::SUCCESS
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(config: FetchConfig) -> ExitCode {
    if !check_config(&config.store) {
        return ExitCode::FAILURE;
    }

    with_cache!(&config.store, |cache| fetch(&cache, &config).await)
}

async fn fetch<S: StoreSource + 'static>(cache: &CellCache<S>, config: &FetchConfig) -> ExitCode {
    let key = match cache
        .cell_key(
            config.setup,
            config.timepoint,
            config.level,
            &config.grid_position(),
        )
        .await
    {
        Ok(key) => key,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cell = match cache.get(&key, LoadingStrategy::Blocking).await {
        Ok(cell) => cell,
        Err(e) => {
            error!("Failed to load {}: {}", key, e);
            return ExitCode::FAILURE;
        }
    };

    println!("Cell: {}", key);
    println!("  dims (x first): {:?}", cell.dims());
    println!("  type: {}", cell.kind().name());
    println!("  elements: {}", cell.num_elements());
    match cell.data().value_range() {
        Some((min, max)) => println!("  range: {} .. {}", min, max),
        None => println!("  range: (empty)"),
    }

    let stats = cache.stats();
    println!(
        "  storage reads: {}, bytes read: {}",
        stats.storage_reads, stats.bytes_read
    );

    cache.close();
    ExitCode::SUCCESS
}
