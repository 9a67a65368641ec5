//! Asynchronous multi-layer tile fetch and cache pipeline.
//!
//! [`TileCache`] lives on the main context. Requests that miss the memory
//! and disk caches become [`DownloadTask`]s in a shared priority queue,
//! drained by a fixed pool of fetch workers running on a Tokio runtime.
//! Workers fetch and decode, then send their outcome through a channel that
//! [`TileCache::poll`] drains once per tick; only `poll` mutates the memory
//! cache.
//!
//! Every (tile, layer) pair moves through
//! `unrequested -> queued -> in flight -> {loaded | retry queued | failed}`.
//! At most one task per pair is queued or in flight at any time. Each
//! request gets a fresh generation number; results whose generation no
//! longer matches the pair's entry are dropped as stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use terrastream_decode::{DecodeError, Raster, decode_raster};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::auth::TokenStore;
use crate::config::TileCacheConfig;
use crate::disk::DiskCache;
use crate::error::{Error, Result};
use crate::fetch::{FetchResponse, Fetcher, HttpFetcher};
use crate::layer::{LayerDescriptor, LayerRegistry};
use crate::memory::MemoryCache;
use crate::queue::{DownloadTask, FetchQueue};
use crate::tile::TileKey;

/// A decoded tile payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    /// An image layer decoded to RGBA.
    Raster(Raster),
    /// A layer with a non-image extension, kept as raw bytes.
    Blob(Vec<u8>),
}

impl TileData {
    /// The raster, if this is an image layer.
    #[must_use]
    pub fn as_raster(&self) -> Option<&Raster> {
        match self {
            TileData::Raster(raster) => Some(raster),
            TileData::Blob(_) => None,
        }
    }

    /// Decode a payload according to the layer's extension.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a corrupt image.
    pub fn decode(
        layer: &LayerDescriptor,
        bytes: &[u8],
    ) -> std::result::Result<Self, DecodeError> {
        if layer.is_raster() {
            decode_raster(bytes).map(TileData::Raster)
        } else {
            Ok(TileData::Blob(bytes.to_vec()))
        }
    }
}

/// Every layer currently cached for one tile.
pub type TileLayers = HashMap<String, Arc<TileData>>;

/// Outcome of [`TileCache::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Already in memory.
    Cached,
    /// Loaded synchronously from disk; a loaded event follows on the next poll.
    DiskHit,
    /// A new download was queued.
    Queued,
    /// A download is already queued, in flight or waiting to retry.
    Pending,
    /// The pair failed terminally; call [`TileCache::clear_failures`] or
    /// [`TileCache::unload`] to allow another attempt.
    Failed,
}

/// Where a (tile, layer) pair currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// Never requested, or unloaded.
    Unrequested,
    /// Waiting in the queue.
    Queued,
    /// A worker is fetching it.
    InFlight,
    /// Waiting out a retry backoff.
    RetryQueued,
    /// In the memory cache.
    Loaded,
    /// Failed terminally.
    Failed,
}

/// Raised by [`TileCache::poll`].
#[derive(Debug, Clone)]
pub enum TileEvent {
    /// A layer finished loading from the network or disk.
    Loaded {
        /// The tile.
        key: TileKey,
        /// The layer that just loaded.
        layer: String,
        /// Every layer currently cached for the tile, including `layer`.
        layers: TileLayers,
    },
    /// A layer failed terminally.
    LoadFailed {
        /// The tile.
        key: TileKey,
        /// The layer that failed.
        layer: String,
        /// The last error.
        error: Arc<Error>,
    },
}

/// Counters describing the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Keys in the memory cache.
    pub memory_entries: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks being fetched.
    pub in_flight: usize,
    /// Tasks waiting out a retry backoff.
    pub retry_waiting: usize,
    /// Pairs that failed terminally.
    pub failed: usize,
    /// Network requests issued for tiles.
    pub network_fetches: u64,
    /// Requests served from disk.
    pub disk_hits: u64,
    /// Keys evicted from memory.
    pub evictions: u64,
    /// Worker results dropped because their pair was unloaded or superseded.
    pub stale_results: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Queued { generation: u64 },
    /// `discard` is set when the tile was unloaded mid-flight; the result is
    /// dropped on arrival unless the pair is requested again.
    InFlight { generation: u64, discard: bool },
    RetryQueued { generation: u64 },
    Failed,
}

impl FetchState {
    fn generation(self) -> Option<u64> {
        match self {
            FetchState::Queued { generation }
            | FetchState::InFlight { generation, .. }
            | FetchState::RetryQueued { generation } => Some(generation),
            FetchState::Failed => None,
        }
    }
}

type PairKey = (TileKey, String);

#[derive(Debug, Default)]
struct PipelineState {
    queue: FetchQueue,
    entries: HashMap<PairKey, FetchState>,
    next_generation: u64,
}

/// State shared between the main context and the fetch workers.
struct Shared {
    state: Mutex<PipelineState>,
    /// One permit per queued task; workers park here while the queue is empty.
    wake: Semaphore,
    fetcher: Arc<dyn Fetcher>,
    tokens: TokenStore,
    disk: Option<DiskCache>,
    config: TileCacheConfig,
    results: async_channel::Sender<WorkerResult>,
    network_fetches: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, task: DownloadTask) {
        self.lock().queue.push(task);
        self.wake.add_permits(1);
    }
}

enum WorkerResult {
    Loaded {
        key: TileKey,
        layer: String,
        generation: u64,
        data: TileData,
    },
    Failed {
        key: TileKey,
        layer: String,
        generation: u64,
        error: Error,
    },
}

/// The tile cache and fetch pipeline.
pub struct TileCache {
    registry: LayerRegistry,
    memory: MemoryCache<Arc<TileData>>,
    shared: Arc<Shared>,
    results: async_channel::Receiver<WorkerResult>,
    /// Disk hits waiting to be reported by the next poll.
    pending_events: Vec<TileEvent>,
    workers: Vec<JoinHandle<()>>,
    disk_hits: u64,
    evictions: u64,
    stale_results: u64,
}

impl TileCache {
    /// Create a pipeline whose workers run on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(
        config: TileCacheConfig,
        registry: LayerRegistry,
        fetcher: Arc<dyn Fetcher>,
        runtime: &Handle,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = async_channel::unbounded();
        let tokens = TokenStore::from_registry(&registry);
        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState::default()),
            wake: Semaphore::new(0),
            fetcher,
            tokens,
            disk: config.cache_dir.clone().map(DiskCache::new),
            config: config.clone(),
            results: tx,
            network_fetches: AtomicU64::new(0),
        });

        let workers = (0..config.fetch_workers)
            .map(|id| runtime.spawn(fetch_worker(Arc::clone(&shared), id)))
            .collect();

        tracing::info!(
            workers = config.fetch_workers,
            capacity = config.memory_capacity,
            disk = ?config.cache_dir,
            layers = registry.len(),
            "Tile cache started"
        );

        Ok(Self {
            registry,
            memory: MemoryCache::new(config.memory_capacity),
            shared,
            results: rx,
            pending_events: Vec::new(),
            workers,
            disk_hits: 0,
            evictions: 0,
            stale_results: 0,
        })
    }

    /// Create a pipeline that fetches over HTTP with `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn with_http(
        config: TileCacheConfig,
        registry: LayerRegistry,
        runtime: &Handle,
    ) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(config.request_timeout)?);
        Self::new(config, registry, fetcher, runtime)
    }

    /// The registered layers.
    #[must_use]
    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// The token store of authenticated layers.
    #[must_use]
    pub fn tokens(&self) -> &TokenStore {
        &self.shared.tokens
    }

    /// A cached layer, marking the tile as recently used. Absence is not an
    /// error.
    pub fn get(&mut self, key: TileKey, layer: &str) -> Option<Arc<TileData>> {
        self.memory.get(&key, layer).cloned()
    }

    /// A cached layer, without affecting eviction order.
    #[must_use]
    pub fn peek(&self, key: TileKey, layer: &str) -> Option<Arc<TileData>> {
        self.memory.peek(&key, layer).cloned()
    }

    /// Every cached layer of a tile.
    #[must_use]
    pub fn layers(&self, key: TileKey) -> TileLayers {
        self.memory.layers(&key).cloned().unwrap_or_default()
    }

    /// Mark a tile as recently used, e.g. because an atlas read it.
    pub fn touch(&mut self, key: TileKey) -> bool {
        self.memory.touch(&key)
    }

    /// Where a (tile, layer) pair currently stands.
    #[must_use]
    pub fn state(&self, key: TileKey, layer: &str) -> TileState {
        if self.memory.peek(&key, layer).is_some() {
            return TileState::Loaded;
        }
        let state = self.shared.lock();
        match state.entries.get(&(key, layer.to_string())) {
            None => TileState::Unrequested,
            Some(FetchState::Queued { .. }) => TileState::Queued,
            Some(FetchState::InFlight { .. }) => TileState::InFlight,
            Some(FetchState::RetryQueued { .. }) => TileState::RetryQueued,
            Some(FetchState::Failed) => TileState::Failed,
        }
    }

    /// Ask for a layer of a tile. Idempotent: repeated calls while a
    /// download is outstanding coalesce into it.
    ///
    /// The disk cache is checked synchronously; a hit is decoded, stored in
    /// memory and reported as a loaded event on the next [`poll`](Self::poll).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayer`] or [`Error::LayerDisabled`] for a layer
    /// that cannot be requested, and [`Error::InvalidTile`] for a key outside
    /// the grid.
    pub fn request(&mut self, key: TileKey, layer: &str) -> Result<RequestStatus> {
        let descriptor = Arc::clone(self.registry.get_enabled(layer)?);
        if !key.is_valid() {
            return Err(Error::InvalidTile(key));
        }

        if self.memory.get(&key, layer).is_some() {
            return Ok(RequestStatus::Cached);
        }

        {
            let mut state = self.shared.lock();
            match state.entries.get_mut(&(key, layer.to_string())) {
                Some(FetchState::Failed) => return Ok(RequestStatus::Failed),
                Some(FetchState::InFlight { discard, .. }) => {
                    *discard = false;
                    return Ok(RequestStatus::Pending);
                }
                Some(_) => return Ok(RequestStatus::Pending),
                None => {}
            }
        }

        if let Some(data) = self.read_disk(key, &descriptor) {
            self.disk_hits += 1;
            self.store(key, layer, data);
            self.pending_events.push(TileEvent::Loaded {
                key,
                layer: layer.to_string(),
                layers: self.layers(key),
            });
            return Ok(RequestStatus::DiskHit);
        }

        {
            let mut state = self.shared.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state
                .entries
                .insert((key, layer.to_string()), FetchState::Queued { generation });
            state
                .queue
                .push(DownloadTask::new(key, descriptor, generation));
        }
        self.shared.wake.add_permits(1);
        tracing::trace!(%key, layer, "Queued");
        Ok(RequestStatus::Queued)
    }

    /// Remove a not-yet-started download. In-flight downloads cannot be
    /// cancelled. Returns whether anything was removed.
    pub fn cancel(&mut self, key: TileKey, layer: &str) -> bool {
        let mut state = self.shared.lock();
        let pair = (key, layer.to_string());
        match state.entries.get(&pair) {
            Some(FetchState::Queued { .. }) => {
                state.entries.remove(&pair);
                state.queue.remove(key, layer);
                true
            }
            Some(FetchState::RetryQueued { .. }) => {
                // The backoff timer finds no matching entry and gives up.
                state.entries.remove(&pair);
                true
            }
            _ => false,
        }
    }

    /// Drop a tile from memory along with its queued downloads and failure
    /// records. In-flight results for it are discarded on arrival. The disk
    /// cache is untouched.
    pub fn unload(&mut self, key: TileKey) {
        self.memory.remove(&key);
        let mut state = self.shared.lock();
        state.queue.remove_where(|task| task.key == key);
        state.entries.retain(|(k, _), entry| {
            if *k != key {
                return true;
            }
            match entry {
                FetchState::InFlight { discard, .. } => {
                    *discard = true;
                    true
                }
                _ => false,
            }
        });
    }

    /// Forget every terminal failure so the pairs can be requested again.
    pub fn clear_failures(&mut self) {
        self.shared
            .lock()
            .entries
            .retain(|_, entry| *entry != FetchState::Failed);
    }

    /// Enable or disable a layer. Disabling drops its queued downloads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayer`] if the layer was never registered.
    pub fn set_layer_enabled(&mut self, layer: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(layer, enabled)?;
        if !enabled {
            let mut state = self.shared.lock();
            let removed = state
                .queue
                .remove_where(|task| task.layer.layer_type == layer);
            state.entries.retain(|(_, l), entry| {
                l != layer
                    || !matches!(
                        entry,
                        FetchState::Queued { .. } | FetchState::RetryQueued { .. }
                    )
            });
            tracing::info!(layer, removed, "Layer disabled");
        }
        Ok(())
    }

    /// Install a token for an authenticated layer and forget the layer's
    /// failures, which were likely caused by the old token.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is unknown or not token-authenticated.
    pub fn set_layer_token(&mut self, layer: &str, token: String) -> Result<()> {
        self.registry.get(layer)?;
        self.shared.tokens.set_token(layer, token)?;
        self.shared
            .lock()
            .entries
            .retain(|(_, l), entry| l != layer || *entry != FetchState::Failed);
        Ok(())
    }

    /// Apply finished downloads and return the resulting events.
    ///
    /// Must be called regularly from the main context.
    pub fn poll(&mut self) -> Vec<TileEvent> {
        let mut events = std::mem::take(&mut self.pending_events);

        while let Ok(result) = self.results.try_recv() {
            match result {
                WorkerResult::Loaded {
                    key,
                    layer,
                    generation,
                    data,
                } => {
                    if !self.settle(key, &layer, generation, None) {
                        continue;
                    }
                    self.store(key, &layer, data);
                    tracing::debug!(%key, layer, "Tile loaded");
                    events.push(TileEvent::Loaded {
                        key,
                        layers: self.layers(key),
                        layer,
                    });
                }
                WorkerResult::Failed {
                    key,
                    layer,
                    generation,
                    error,
                } => {
                    if !self.settle(key, &layer, generation, Some(FetchState::Failed)) {
                        continue;
                    }
                    tracing::warn!(%key, layer, "Tile failed: {error}");
                    events.push(TileEvent::LoadFailed {
                        key,
                        layer,
                        error: Arc::new(error),
                    });
                }
            }
        }

        events
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        let mut stats = CacheStats {
            memory_entries: self.memory.len(),
            queued: 0,
            in_flight: 0,
            retry_waiting: 0,
            failed: 0,
            network_fetches: self.shared.network_fetches.load(Ordering::Relaxed),
            disk_hits: self.disk_hits,
            evictions: self.evictions,
            stale_results: self.stale_results,
        };
        for entry in state.entries.values() {
            match entry {
                FetchState::Queued { .. } => stats.queued += 1,
                FetchState::InFlight { .. } => stats.in_flight += 1,
                FetchState::RetryQueued { .. } => stats.retry_waiting += 1,
                FetchState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Resolve the pair's entry for a worker result. Returns whether the
    /// result is current; stale results are counted and dropped.
    fn settle(
        &mut self,
        key: TileKey,
        layer: &str,
        generation: u64,
        next: Option<FetchState>,
    ) -> bool {
        let current = {
            let mut state = self.shared.lock();
            let pair = (key, layer.to_string());
            match state.entries.get(&pair).copied() {
                Some(FetchState::InFlight {
                    generation: g,
                    discard: false,
                }) if g == generation => {
                    match next {
                        Some(next) => state.entries.insert(pair, next),
                        None => state.entries.remove(&pair),
                    };
                    true
                }
                Some(FetchState::InFlight {
                    generation: g,
                    discard: true,
                }) if g == generation => {
                    state.entries.remove(&pair);
                    false
                }
                _ => false,
            }
        };
        if !current {
            self.stale_results += 1;
            tracing::debug!(%key, layer, generation, "Dropped stale result");
        }
        current
    }

    fn store(&mut self, key: TileKey, layer: &str, data: TileData) {
        let evicted = self.memory.insert(key, layer, Arc::new(data));
        for victim in evicted {
            self.evictions += 1;
            tracing::trace!(key = %victim, "Evicted from memory");
        }
    }

    fn read_disk(&self, key: TileKey, layer: &LayerDescriptor) -> Option<TileData> {
        let disk = self.shared.disk.as_ref()?;
        let bytes = match disk.read(&layer.layer_type, key, &layer.extension) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(%key, layer = layer.layer_type, "Disk read failed: {e}");
                return None;
            }
        };
        match TileData::decode(layer, &bytes) {
            Ok(data) => {
                tracing::debug!(%key, layer = layer.layer_type, "Disk cache hit");
                Some(data)
            }
            Err(e) => {
                tracing::warn!(%key, layer = layer.layer_type, "Corrupt disk cache entry: {e}");
                None
            }
        }
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        self.shared.wake.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Pull tasks until the wake semaphore is closed.
async fn fetch_worker(shared: Arc<Shared>, id: usize) {
    tracing::trace!(worker = id, "Fetch worker started");
    loop {
        match shared.wake.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }

        let task = {
            let mut state = shared.lock();
            let Some(task) = state.queue.pop() else {
                continue;
            };
            let pair = (task.key, task.layer.layer_type.clone());
            match state.entries.get(&pair).and_then(|e| e.generation()) {
                Some(g) if g == task.generation => {
                    state.entries.insert(
                        pair,
                        FetchState::InFlight {
                            generation: g,
                            discard: false,
                        },
                    );
                    task
                }
                _ => continue,
            }
        };

        run_task(&shared, task).await;
    }
    tracing::trace!(worker = id, "Fetch worker stopped");
}

async fn run_task(shared: &Arc<Shared>, task: DownloadTask) {
    let key = task.key;
    let layer = task.layer.layer_type.clone();

    let result = match fetch_payload(shared, &task).await {
        Ok(bytes) => decode_and_persist(shared, &task, bytes).await,
        Err(e) => Err(e),
    };

    let message = match result {
        Ok(data) => WorkerResult::Loaded {
            key,
            layer,
            generation: task.generation,
            data,
        },
        Err(e) if e.is_transient() && task.attempt < shared.config.max_attempts => {
            schedule_retry(shared, &task, &e);
            return;
        }
        Err(error) => WorkerResult::Failed {
            key,
            layer,
            generation: task.generation,
            error,
        },
    };
    let _ = shared.results.send(message).await;
}

/// Fetch the payload, handling token acquisition and one refresh-and-retry
/// when the server rejects the token.
async fn fetch_payload(shared: &Shared, task: &DownloadTask) -> Result<Vec<u8>> {
    let fetcher = shared.fetcher.as_ref();
    let layer = task.layer.layer_type.as_str();

    let token = if task.layer.requires_token() {
        Some(shared.tokens.token(layer, fetcher).await?)
    } else {
        None
    };

    let url = task.url(token.as_deref());
    let mut response = get_with_timeout(shared, &url, token.as_deref()).await?;

    if response.is_auth_rejection()
        && let Some(rejected) = token
    {
        tracing::info!(key = %task.key, layer, status = response.status, "Token rejected");
        let fresh = shared
            .tokens
            .refresh_after_rejection(layer, &rejected, fetcher)
            .await?;
        let url = task.url(Some(&fresh));
        response = get_with_timeout(shared, &url, Some(&fresh)).await?;
        if response.is_auth_rejection() {
            return Err(Error::Auth {
                layer: layer.to_string(),
                detail: format!("refreshed token rejected with status {}", response.status),
            });
        }
    }

    if !response.is_success() {
        return Err(Error::HttpStatus {
            url,
            status: response.status,
        });
    }
    Ok(response.body)
}

async fn get_with_timeout(
    shared: &Shared,
    url: &str,
    bearer: Option<&str>,
) -> Result<FetchResponse> {
    shared.network_fetches.fetch_add(1, Ordering::Relaxed);
    match tokio::time::timeout(
        shared.config.request_timeout,
        shared.fetcher.get(url, bearer),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            url: url.to_string(),
        }),
    }
}

/// Decode off the async threads, then write the fetched bytes to disk.
async fn decode_and_persist(
    shared: &Shared,
    task: &DownloadTask,
    bytes: Vec<u8>,
) -> Result<TileData> {
    let layer = Arc::clone(&task.layer);
    let (decoded, bytes) = tokio::task::spawn_blocking(move || {
        let decoded = TileData::decode(&layer, &bytes);
        (decoded, bytes)
    })
    .await
    .map_err(|e| {
        Error::Decode(DecodeError::InvalidFormat {
            context: "tile payload",
            detail: format!("decode task failed: {e}"),
        })
    })?;
    let data = decoded?;

    if let Some(disk) = &shared.disk
        && let Err(e) = disk
            .write(&task.layer.layer_type, task.key, &task.layer.extension, &bytes)
            .await
    {
        tracing::warn!(key = %task.key, layer = task.layer.layer_type, "Disk write failed: {e}");
    }
    Ok(data)
}

fn schedule_retry(shared: &Arc<Shared>, task: &DownloadTask, error: &Error) {
    let pair = (task.key, task.layer.layer_type.clone());
    {
        let mut state = shared.lock();
        match state.entries.get(&pair).copied() {
            Some(FetchState::InFlight {
                generation,
                discard: false,
            }) if generation == task.generation => {
                state
                    .entries
                    .insert(pair.clone(), FetchState::RetryQueued { generation });
            }
            _ => {
                // Unloaded or superseded while in flight.
                state.entries.remove(&pair);
                return;
            }
        }
    }

    let delay = backoff_delay(shared.config.retry_backoff, task.attempt);
    tracing::debug!(
        key = %task.key,
        layer = task.layer.layer_type,
        attempt = task.attempt,
        delay_ms = delay.as_millis(),
        "Retrying after error: {error}"
    );

    let shared = Arc::clone(shared);
    let retry = task.retry();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut state = shared.lock();
            match state.entries.get(&pair) {
                Some(FetchState::RetryQueued { generation }) if *generation == retry.generation => {
                    state.entries.insert(
                        pair,
                        FetchState::Queued {
                            generation: retry.generation,
                        },
                    );
                }
                _ => return,
            }
        }
        shared.enqueue(retry);
    });
}

/// Delay before re-queueing after failed attempt number `attempt`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(800));
        // Large attempt counts are capped rather than overflowing.
        assert_eq!(backoff_delay(base, 100), base * (1 << 16));
    }

    #[test]
    fn test_decode_by_extension() {
        let blob_layer = LayerDescriptor::new("mesh", "{z}/{x}/{y}", "bin");
        let data = TileData::decode(&blob_layer, &[1, 2, 3]).unwrap();
        assert_eq!(data, TileData::Blob(vec![1, 2, 3]));
        assert!(data.as_raster().is_none());

        let png_layer = LayerDescriptor::new("heightmap", "{z}/{x}/{y}", "png");
        assert!(TileData::decode(&png_layer, b"not a png").is_err());
    }

    #[test]
    fn test_fetch_state_generation() {
        assert_eq!(FetchState::Queued { generation: 3 }.generation(), Some(3));
        assert_eq!(FetchState::Failed.generation(), None);
    }
}
