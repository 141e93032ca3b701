//! Concurrent cache of decoded cells.
//!
//! Every [`ChunkKey`] moves through `Unrequested -> Pending -> Resident`.
//! A pending key is backed by exactly one [`LoadRequest`]; callers that ask
//! for the same key while it is pending attach to that request instead of
//! reading storage again.
//!
//! Two retrieval strategies are offered:
//!
//! - [`LoadingStrategy::Blocking`] waits for the cell. If nobody has started
//!   loading it yet, the caller loads it itself.
//! - [`LoadingStrategy::Budgeted`] never waits for storage. It queues the
//!   load for the worker pool and returns a zero-filled placeholder.
//!
//! Queued loads are served per pyramid level, coarsest level first.
//!
//! The storage handle, metadata and worker pool live in an `Open` lifecycle
//! state. `close()` tears them down; the next access reopens everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::array::{CellGeometry, TypedCell};
use super::fetcher::ChunkFetcher;
use super::queue::FetchQueues;
use crate::config::CacheConfig;
use crate::error::{report_state_error, CacheError, CacheStateError};
use crate::io::StoreSource;
use crate::ome::{AxisTag, Container, MultiscaleMetadataResolver, PyramidSetup};
use crate::zarr::{ByteOrder, ZarrReader};

// =============================================================================
// Keys and strategies
// =============================================================================

/// Identifies one cacheable cell.
///
/// `grid_position` is in declared axis order and has one entry per axis of
/// the setup, including the channel and time axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub setup: usize,
    pub timepoint: u64,
    pub level: usize,
    pub grid_position: Vec<u64>,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "setup {} t{} level {} {:?}",
            self.setup, self.timepoint, self.level, self.grid_position
        )
    }
}

/// How [`CellCache::get`] treats a cell that is not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStrategy {
    /// Wait until the cell is loaded.
    Blocking,

    /// Queue the load and return a placeholder immediately.
    Budgeted,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Chunk reads issued against storage (including missing chunks).
    pub storage_reads: u64,

    /// Decompressed bytes returned by storage.
    pub bytes_read: u64,

    /// Requests answered from a resident cell.
    pub hits: u64,

    /// Requests for a cell that was not resident.
    pub misses: u64,

    /// Placeholders handed out by budgeted requests.
    pub placeholders: u64,
}

#[derive(Debug, Default)]
struct Counters {
    storage_reads: AtomicU64,
    bytes_read: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    placeholders: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            storage_reads: self.storage_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Load requests
// =============================================================================

#[derive(Debug, Clone)]
enum LoadState {
    Pending,
    Done(Arc<TypedCell>),
    Abandoned,
}

/// In-flight load of one key.
///
/// Whoever wins [`try_claim`](Self::try_claim) performs the load; everyone
/// else waits on the state channel.
struct LoadRequest {
    key: ChunkKey,
    setup: Arc<PyramidSetup>,
    geometry: CellGeometry,
    claimed: AtomicBool,
    state: watch::Sender<LoadState>,
}

impl LoadRequest {
    fn new(key: ChunkKey, setup: Arc<PyramidSetup>, geometry: CellGeometry) -> Self {
        let (state, _) = watch::channel(LoadState::Pending);
        Self {
            key,
            setup,
            geometry,
            claimed: AtomicBool::new(false),
            state,
        }
    }

    fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Wait for a request to settle.
///
/// Returns `None` if it was abandoned.
async fn wait_for(request: Arc<LoadRequest>) -> Option<Arc<TypedCell>> {
    let mut rx = request.state.subscribe();
    drop(request);

    let state = rx
        .wait_for(|s| !matches!(s, LoadState::Pending))
        .await
        .ok()?
        .clone();

    match state {
        LoadState::Done(cell) => Some(cell),
        _ => None,
    }
}

// =============================================================================
// Open state
// =============================================================================

struct Entries {
    resident: LruCache<ChunkKey, Arc<TypedCell>>,
    pending: HashMap<ChunkKey, Arc<LoadRequest>>,
}

/// Everything that exists while the cache is open.
struct Shared<S: StoreSource> {
    reader: ZarrReader<S::Store>,
    container: Container,
    fetcher: ChunkFetcher,
    entries: Mutex<Entries>,
    queues: FetchQueues<Arc<LoadRequest>>,
    counters: Arc<Counters>,
}

impl<S: StoreSource + 'static> Shared<S> {
    fn setup(&self, id: usize) -> Result<&Arc<PyramidSetup>, CacheError> {
        self.container.setup(id).ok_or(CacheError::UnknownSetup(id))
    }

    /// Check a key against the setup geometry.
    fn validate(&self, key: &ChunkKey) -> Result<(Arc<PyramidSetup>, CellGeometry), CacheError> {
        let setup = self.setup(key.setup)?;
        let level = setup.level(key.level).ok_or(CacheError::InvalidLevel {
            setup: key.setup,
            level: key.level,
        })?;
        if key.timepoint >= setup.num_timepoints() {
            return Err(CacheError::InvalidTimepoint {
                setup: key.setup,
                timepoint: key.timepoint,
            });
        }

        let geometry = CellGeometry::for_chunk(
            setup.axes(),
            level.attributes(),
            &key.grid_position,
            setup.channel(),
            key.timepoint,
        )
        .ok_or_else(|| CacheError::InvalidGridPosition(key.to_string()))?;

        Ok((setup.clone(), geometry))
    }

    fn get_budgeted(
        &self,
        key: &ChunkKey,
        setup: Arc<PyramidSetup>,
        geometry: CellGeometry,
    ) -> Arc<TypedCell> {
        let kind = setup.kind();
        let placeholder = TypedCell::placeholder(kind, geometry.dims());

        let enqueue = {
            let mut entries = self.entries.lock();
            if let Some(cell) = entries.resident.get(key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return cell.clone();
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);

            match entries.pending.get(key) {
                // Move to the front so the latest request is served first
                Some(request) if !request.is_claimed() => Some(request.clone()),
                Some(_) => None,
                None => {
                    let request = Arc::new(LoadRequest::new(key.clone(), setup, geometry));
                    entries.pending.insert(key.clone(), request.clone());
                    Some(request)
                }
            }
        };

        if let Some(request) = enqueue {
            self.queues
                .push(key.level, request.clone(), |queued| Arc::ptr_eq(queued, &request));
            debug!(key = %key, queued = self.queues.len(), "Queued load");
        }

        self.counters.placeholders.fetch_add(1, Ordering::Relaxed);
        Arc::new(placeholder)
    }

    /// Returns `None` if the request was abandoned and must be retried.
    async fn get_blocking(
        &self,
        key: &ChunkKey,
        setup: Arc<PyramidSetup>,
        geometry: CellGeometry,
    ) -> Option<Arc<TypedCell>> {
        let request = {
            let mut entries = self.entries.lock();
            if let Some(cell) = entries.resident.get(key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(cell.clone());
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);

            match entries.pending.get(key) {
                Some(request) => request.clone(),
                None => {
                    let request = Arc::new(LoadRequest::new(key.clone(), setup, geometry));
                    entries.pending.insert(key.clone(), request.clone());
                    request
                }
            }
        };

        if request.try_claim() {
            return Some(self.run(&request).await);
        }

        wait_for(request).await
    }

    /// Load a claimed request and publish the result.
    async fn run(&self, request: &Arc<LoadRequest>) -> Arc<TypedCell> {
        let mut guard = AbandonOnDrop {
            shared: self,
            request,
            armed: true,
        };

        let cell = Arc::new(self.read_cell(request).await);

        guard.armed = false;
        self.complete(request, cell.clone());
        cell
    }

    /// Fetch and decode a cell. Missing or unreadable chunks give zeros.
    async fn read_cell(&self, request: &LoadRequest) -> TypedCell {
        let key = &request.key;
        let setup = &request.setup;
        let kind = setup.kind();

        let block = self
            .fetcher
            .fetch(&self.reader, setup, key.level, &key.grid_position)
            .await;
        self.counters.storage_reads.fetch_add(1, Ordering::Relaxed);

        let Some(raw) = block else {
            return TypedCell::zero_filled(kind, request.geometry.dims());
        };
        self.counters
            .bytes_read
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let byte_order = setup
            .level(key.level)
            .map(|l| l.attributes().byte_order())
            .unwrap_or(ByteOrder::Little);

        match TypedCell::decode(kind, byte_order, &raw, &request.geometry) {
            Ok(cell) => cell,
            Err(e) => {
                warn!(key = %key, "Could not decode chunk, returning zeros: {}", e);
                TypedCell::zero_filled(kind, request.geometry.dims())
            }
        }
    }

    /// Move a finished request from pending to resident and wake waiters.
    fn complete(&self, request: &Arc<LoadRequest>, cell: Arc<TypedCell>) {
        let mut entries = self.entries.lock();
        // Closed mid-load: waiters still get the cell but it is not kept.
        // `shutdown` sets the flag before draining under this lock.
        if !self.queues.is_shut_down() {
            let matches = entries
                .pending
                .get(&request.key)
                .is_some_and(|p| Arc::ptr_eq(p, request));

            if matches {
                entries.pending.remove(&request.key);
                if entries.resident.contains(&request.key) {
                    report_state_error(CacheStateError::DuplicateResident(
                        request.key.to_string(),
                    ));
                }
                entries.resident.put(request.key.clone(), cell.clone());
            } else {
                report_state_error(CacheStateError::MissingPending(request.key.to_string()));
            }
        }
        drop(entries);

        request.state.send_replace(LoadState::Done(cell));
    }

    /// Forget an unfinished request and release its waiters.
    fn abandon(&self, request: &Arc<LoadRequest>) {
        {
            let mut entries = self.entries.lock();
            if entries
                .pending
                .get(&request.key)
                .is_some_and(|p| Arc::ptr_eq(p, request))
            {
                entries.pending.remove(&request.key);
            }
        }
        request.state.send_replace(LoadState::Abandoned);
    }

    fn clear(&self) {
        self.entries.lock().resident.clear();
    }

    /// Stop the workers and drop every cell and pending request.
    fn shutdown(&self) {
        self.queues.shutdown();

        let pending: Vec<Arc<LoadRequest>> = {
            let mut entries = self.entries.lock();
            entries.resident.clear();
            entries.pending.drain().map(|(_, r)| r).collect()
        };
        for request in pending {
            request.state.send_replace(LoadState::Abandoned);
        }
    }
}

/// Abandons a claimed request whose load did not finish (e.g. the blocking
/// caller was cancelled mid-read).
struct AbandonOnDrop<'a, S: StoreSource + 'static> {
    shared: &'a Shared<S>,
    request: &'a Arc<LoadRequest>,
    armed: bool,
}

impl<S: StoreSource + 'static> Drop for AbandonOnDrop<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            debug!(key = %self.request.key, "Abandoning unfinished load");
            self.shared.abandon(self.request);
        }
    }
}

async fn worker_loop<S: StoreSource + 'static>(shared: Arc<Shared<S>>, worker: usize) {
    while let Some(request) = shared.queues.pop().await {
        if request.try_claim() {
            shared.run(&request).await;
        }
    }
    debug!(worker = worker, "Fetch worker stopped");
}

// =============================================================================
// Lifecycle
// =============================================================================

enum Lifecycle<S: StoreSource> {
    Closed,
    Opening {
        epoch: u64,
        done: watch::Receiver<()>,
    },
    Open(Arc<Shared<S>>),
}

enum OpenStep<S: StoreSource> {
    Ready(Arc<Shared<S>>),
    Wait(watch::Receiver<()>),
    Open(u64, watch::Sender<()>),
}

/// Resets an `Opening` state to `Closed` if the opener is cancelled.
struct OpeningGuard<'a, S: StoreSource> {
    lifecycle: &'a Mutex<Lifecycle<S>>,
    epoch: u64,
    armed: bool,
}

impl<S: StoreSource> Drop for OpeningGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.lifecycle.lock();
            if matches!(*state, Lifecycle::Opening { epoch, .. } if epoch == self.epoch) {
                *state = Lifecycle::Closed;
            }
        }
    }
}

// =============================================================================
// Cell cache
// =============================================================================

/// Cache of decoded cells for one OME-Zarr container.
///
/// The container is opened lazily on first use. All methods take `&self`;
/// the cache is meant to be shared (e.g. in an `Arc`) between the tasks
/// requesting cells.
pub struct CellCache<S: StoreSource> {
    source: S,
    config: CacheConfig,
    lifecycle: Mutex<Lifecycle<S>>,
    epoch: AtomicU64,
    counters: Arc<Counters>,
}

impl<S: StoreSource + 'static> CellCache<S> {
    /// Create a cache over the container behind `source`.
    pub fn new(source: S, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            lifecycle: Mutex::new(Lifecycle::Closed),
            epoch: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the cell for `key`.
    ///
    /// Missing chunks and storage failures produce zero-filled cells; an
    /// error is only returned when the container cannot be opened or the key
    /// does not address a cell.
    pub async fn get(
        &self,
        key: &ChunkKey,
        strategy: LoadingStrategy,
    ) -> Result<Arc<TypedCell>, CacheError> {
        loop {
            let shared = self.shared().await?;
            let (setup, geometry) = shared.validate(key)?;

            match strategy {
                LoadingStrategy::Budgeted => {
                    return Ok(shared.get_budgeted(key, setup, geometry));
                }
                LoadingStrategy::Blocking => {
                    if let Some(cell) = shared.get_blocking(key, setup, geometry).await {
                        return Ok(cell);
                    }
                    debug!(key = %key, "Load was abandoned, retrying");
                }
            }
        }
    }

    /// Key of the cell holding spatial grid position `spatial` (`x, y, z`)
    /// of a setup at a level and timepoint.
    pub async fn cell_key(
        &self,
        setup: usize,
        timepoint: u64,
        level: usize,
        spatial: &[u64],
    ) -> Result<ChunkKey, CacheError> {
        let shared = self.shared().await?;
        let pyramid = shared.setup(setup)?;
        let pyramid_level = pyramid
            .level(level)
            .ok_or(CacheError::InvalidLevel { setup, level })?;

        let axes = pyramid.axes();
        let chunks = pyramid_level.chunk_shape();
        let chunk_extent = |tag: AxisTag| {
            axes.declared_index(tag)
                .and_then(|d| chunks.get(d).copied())
                .unwrap_or(1)
        };

        let grid_position = shared.fetcher.logical_to_raw(
            axes,
            spatial,
            pyramid.channel() / chunk_extent(AxisTag::C),
            timepoint / chunk_extent(AxisTag::T),
        );

        Ok(ChunkKey {
            setup,
            timepoint,
            level,
            grid_position,
        })
    }

    /// All setups of the container.
    pub async fn setups(&self) -> Result<Vec<Arc<PyramidSetup>>, CacheError> {
        Ok(self.shared().await?.container.setups().to_vec())
    }

    pub async fn setup(&self, id: usize) -> Result<Arc<PyramidSetup>, CacheError> {
        Ok(self.shared().await?.setup(id)?.clone())
    }

    /// Largest timepoint count over all setups.
    pub async fn num_timepoints(&self) -> Result<u64, CacheError> {
        Ok(self.shared().await?.container.num_timepoints())
    }

    /// Drop all resident cells. Pending loads still complete.
    pub fn clear(&self) {
        if let Lifecycle::Open(shared) = &*self.lifecycle.lock() {
            shared.clear();
        }
    }

    /// Stop the workers and drop all cells and metadata.
    ///
    /// The next access reopens the container.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);
        if let Lifecycle::Open(shared) = previous {
            shared.shutdown();
            info!("Closed cell cache for {}", shared.reader.location());
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Open(_))
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Number of resident cells (0 when closed).
    pub fn resident_cells(&self) -> usize {
        match &*self.lifecycle.lock() {
            Lifecycle::Open(shared) => shared.entries.lock().resident.len(),
            _ => 0,
        }
    }

    /// Number of loads waiting for a fetch worker (0 when closed).
    pub fn queued_loads(&self) -> usize {
        match &*self.lifecycle.lock() {
            Lifecycle::Open(shared) => shared.queues.len(),
            _ => 0,
        }
    }

    /// Get the open state, opening the container if needed.
    async fn shared(&self) -> Result<Arc<Shared<S>>, CacheError> {
        loop {
            let step = {
                let mut state = self.lifecycle.lock();
                let existing = match &*state {
                    Lifecycle::Open(shared) => Some(OpenStep::Ready(shared.clone())),
                    Lifecycle::Opening { done, .. } => Some(OpenStep::Wait(done.clone())),
                    Lifecycle::Closed => None,
                };
                existing.unwrap_or_else(|| {
                    let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
                    let (tx, rx) = watch::channel(());
                    *state = Lifecycle::Opening { epoch, done: rx };
                    OpenStep::Open(epoch, tx)
                })
            };

            match step {
                OpenStep::Ready(shared) => return Ok(shared),
                OpenStep::Wait(mut done) => {
                    // Wakes when the opener finishes, successfully or not
                    let _ = done.changed().await;
                }
                OpenStep::Open(epoch, done) => {
                    let result = self.open(epoch).await;
                    drop(done);
                    match result {
                        Ok(Some(shared)) => return Ok(shared),
                        // Closed while opening
                        Ok(None) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Open the container and start the workers.
    ///
    /// Returns `Ok(None)` if the cache was closed while opening.
    async fn open(&self, epoch: u64) -> Result<Option<Arc<Shared<S>>>, CacheError> {
        let mut guard = OpeningGuard {
            lifecycle: &self.lifecycle,
            epoch,
            armed: true,
        };

        let result = self.build_shared().await;

        let mut state = self.lifecycle.lock();
        guard.armed = false;
        let current = matches!(*state, Lifecycle::Opening { epoch: e, .. } if e == epoch);

        match result {
            Ok(shared) if current => {
                *state = Lifecycle::Open(shared.clone());
                drop(state);
                self.spawn_workers(&shared);
                Ok(Some(shared))
            }
            Ok(shared) => {
                drop(state);
                shared.shutdown();
                Ok(None)
            }
            Err(e) => {
                if current {
                    *state = Lifecycle::Closed;
                }
                Err(e)
            }
        }
    }

    async fn build_shared(&self) -> Result<Arc<Shared<S>>, CacheError> {
        let store = self
            .source
            .open_store()
            .await
            .map_err(|e| CacheError::Open(e.into()))?;
        let reader = ZarrReader::new(store);

        let resolver =
            MultiscaleMetadataResolver::new().with_preferred(self.config.preferred_multiscale.clone());
        let container = Container::open(&reader, &resolver).await?;

        let resident = match self.config.max_resident_cells {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };

        info!(
            setups = container.setups().len(),
            levels = container.max_levels(),
            "Opened {}",
            reader.location()
        );

        Ok(Arc::new(Shared {
            fetcher: ChunkFetcher::new(self.config.log_fetches),
            queues: FetchQueues::new(container.max_levels()),
            entries: Mutex::new(Entries {
                resident,
                pending: HashMap::new(),
            }),
            counters: self.counters.clone(),
            reader,
            container,
        }))
    }

    fn spawn_workers(&self, shared: &Arc<Shared<S>>) {
        let workers = self.config.worker_count();
        for worker in 0..workers {
            tokio::spawn(worker_loop(shared.clone(), worker));
        }
        debug!(workers = workers, "Started fetch workers");
    }
}

impl<S: StoreSource> Drop for CellCache<S> {
    fn drop(&mut self) {
        if let Lifecycle::Open(shared) = &*self.lifecycle.get_mut() {
            shared.queues.shutdown();
        }
    }
}
