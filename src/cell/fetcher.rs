use std::time::Instant;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::io::ObjectStore;
use crate::ome::{AxisDescriptor, PyramidSetup};
use crate::zarr::ZarrReader;

/// Reads single chunks for the cache.
///
/// Never fails: transport errors are logged and reported as a missing
/// chunk, which the cache turns into a zero-filled cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkFetcher {
    log_fetches: bool,
}

impl ChunkFetcher {
    /// Create a fetcher; with `log_fetches`, every read is logged with its
    /// size and throughput.
    pub fn new(log_fetches: bool) -> Self {
        Self { log_fetches }
    }

    /// Full grid position for a spatial grid position, channel and
    /// timepoint.
    pub fn logical_to_raw(
        &self,
        axes: &AxisDescriptor,
        spatial: &[u64],
        channel: u64,
        timepoint: u64,
    ) -> Vec<u64> {
        axes.grid_position_for(spatial, channel, timepoint)
    }

    /// Read and decompress the chunk at `grid_position` of a setup level.
    ///
    /// Returns `None` when the chunk does not exist or could not be read.
    pub async fn fetch<S: ObjectStore>(
        &self,
        reader: &ZarrReader<S>,
        setup: &PyramidSetup,
        level: usize,
        grid_position: &[u64],
    ) -> Option<Bytes> {
        let Some(pyramid_level) = setup.level(level) else {
            warn!(setup = setup.id(), level = level, "Fetch for a level the setup does not have");
            return None;
        };
        let path = pyramid_level.path();

        let start = Instant::now();
        let block = match reader
            .read_block(path, pyramid_level.attributes(), grid_position)
            .await
        {
            Ok(block) => block,
            Err(e) => {
                error!(path = path, "Chunk {:?} could not be read: {}", grid_position, e);
                None
            }
        };

        if self.log_fetches {
            match &block {
                Some(data) => {
                    let millis = start.elapsed().as_millis();
                    let kind = setup.kind();
                    let num_elements = data.len() / kind.size();
                    let megabytes = data.len() as f64 / 1_000_000.0;
                    let seconds = start.elapsed().as_secs_f64().max(f64::EPSILON);
                    info!(
                        "{} {:?}: Read {} {} ({:.3} MB) in {} ms ({:.3} MB/s)",
                        path,
                        grid_position,
                        num_elements,
                        kind.name(),
                        megabytes,
                        millis,
                        megabytes / seconds
                    );
                }
                None => warn!("{} {:?}: Missing, returning zeros", path, grid_position),
            }
        }

        block
    }
}
