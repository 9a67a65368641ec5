//! Height-field collision generation.
//!
//! Heightmap tiles at a fixed collision zoom are turned into height-field
//! shapes on a pool of worker threads. Workers only do the pure part (decode
//! and resample); finished shapes come back through a channel and are cached
//! and attached to the physics world in [`CollisionGenerator::poll`], on the
//! caller's thread.
//!
//! Only the active tile's shape is attached. A shape that finishes after the
//! observer has moved on is cached but left detached, so moving back to it is
//! a cache hit.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use glam::DVec3;
use terrastream_decode::{DecodeError, HeightField, Raster, height_range};

use crate::cache::TileData;
use crate::config::CollisionConfig;
use crate::coords::{CoordinateSystem, tile_size_meters};
use crate::error::{Error, Result};
use crate::surface::{BodyHandle, PhysicsWorld};
use crate::tile::TileKey;

/// Share of outlier samples, split between both tails, left out of a
/// shape's height bounds.
const BOUNDS_TRIM_PERCENT: f32 = 1.0;

/// Identifies one collision shape.
///
/// `tile` is the heightmap tile the shape is built from; `positioning_zoom`
/// is the zoom whose tile size sets the shape's physical extent. Shapes are
/// only built when the two match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollisionKey {
    /// The source heightmap tile.
    pub tile: TileKey,
    /// Zoom used for world placement and scale.
    pub positioning_zoom: u8,
}

impl CollisionKey {
    /// A key positioned at the tile's own zoom.
    #[must_use]
    pub fn new(tile: TileKey) -> Self {
        Self {
            tile,
            positioning_zoom: tile.zoom,
        }
    }
}

impl std::fmt::Display for CollisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.tile, self.positioning_zoom)
    }
}

/// A height-field collider ready to hand to a [`PhysicsWorld`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeightFieldShape {
    /// The key this shape was built for.
    pub key: CollisionKey,
    /// Samples along the east-west axis.
    pub width: usize,
    /// Samples along the north-south axis.
    pub depth: usize,
    /// Elevations in meters, row-major, row 0 at the north edge.
    pub heights: Vec<f32>,
    /// Per-axis scale: one grid cell along X and Z, meters along Y.
    pub scale: DVec3,
    /// World position of the footprint's center at elevation 0.
    pub position: DVec3,
    /// Lowest elevation, ignoring the lowest outliers.
    pub min_height: f32,
    /// Highest elevation, ignoring the highest outliers.
    pub max_height: f32,
}

impl HeightFieldShape {
    /// Build a shape from a raw terrarium tile.
    ///
    /// The footprint is `key.tile`, anchored at its north-west corner, and
    /// each grid cell spans `tile_size_meters(zoom) / (resolution - 1)`
    /// meters so that the edge samples land on the tile edges.
    ///
    /// # Errors
    ///
    /// Returns a decode error for an unusable raster,
    /// [`Error::InvalidRegion`] when `key.positioning_zoom` differs from the
    /// tile's zoom, and [`Error::OriginUnset`] without an origin.
    pub fn build(
        key: CollisionKey,
        raster: &Raster,
        coords: &CoordinateSystem,
        max_resolution: usize,
    ) -> Result<Self> {
        if key.positioning_zoom != key.tile.zoom {
            return Err(Error::InvalidRegion {
                key: key.tile,
                detail: format!(
                    "positioning zoom {} differs from tile zoom {}",
                    key.positioning_zoom, key.tile.zoom
                ),
            });
        }
        let field = HeightField::from_tile(raster, max_resolution)?;
        let extent = tile_size_meters(key.tile.zoom);
        let cell = field.cell_size(extent);
        let corner = coords.try_tile_to_world(key.tile)?;
        let half = extent / 2.0;
        let (min_height, max_height) = height_range(raster, BOUNDS_TRIM_PERCENT)
            .or_else(|| field.bounds())
            .unwrap_or((0.0, 0.0));

        Ok(Self {
            key,
            width: field.width,
            depth: field.depth,
            heights: field.heights,
            scale: DVec3::new(cell, 1.0, cell),
            position: corner + DVec3::new(half, 0.0, half),
            min_height,
            max_height,
        })
    }

    /// Edge length of the footprint along X, in meters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn extent(&self) -> f64 {
        self.scale.x * self.width.saturating_sub(1) as f64
    }
}

/// Outcome of [`CollisionGenerator::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// A shape is already cached for the key.
    Cached,
    /// A job was queued.
    Queued,
    /// A job for the key is already queued or running.
    Duplicate,
}

/// A finished job, reported by [`CollisionGenerator::poll`].
#[derive(Debug, Clone)]
pub enum CollisionEvent {
    /// A shape was built and cached.
    Built {
        /// The shape's key.
        key: CollisionKey,
        /// Whether it was attached as the active body.
        attached: bool,
    },
    /// The job failed; the tile has no collision until resubmitted.
    Failed {
        /// The job's key.
        key: CollisionKey,
        /// Why it failed.
        error: Arc<Error>,
    },
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollisionStats {
    /// Shapes in the cache.
    pub cached: usize,
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Jobs queued or being built.
    pub pending: usize,
    /// Shapes built since creation.
    pub built: u64,
    /// Jobs that failed since creation.
    pub failed: u64,
    /// Key of the attached body.
    pub attached: Option<CollisionKey>,
}

struct CollisionJob {
    key: CollisionKey,
    heightmap: Arc<TileData>,
    coords: CoordinateSystem,
}

struct JobResult {
    key: CollisionKey,
    result: Result<HeightFieldShape>,
}

#[derive(Default)]
struct JobQueueState {
    jobs: VecDeque<CollisionJob>,
    closed: bool,
}

/// FIFO of collision jobs. Idle workers wait on the condition variable.
#[derive(Default)]
struct JobQueue {
    state: Mutex<JobQueueState>,
    ready: Condvar,
}

impl JobQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, JobQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, job: CollisionJob) {
        self.lock().jobs.push_back(job);
        self.ready.notify_one();
    }

    /// Block until a job is available. Returns `None` once closed.
    fn pop(&self) -> Option<CollisionJob> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop queued jobs whose key fails `keep`. Returns the dropped keys.
    fn retain(&self, mut keep: impl FnMut(&CollisionKey) -> bool) -> Vec<CollisionKey> {
        let mut dropped = Vec::new();
        self.lock().jobs.retain(|job| {
            let kept = keep(&job.key);
            if !kept {
                dropped.push(job.key);
            }
            kept
        });
        dropped
    }

    fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// Worker pool and shape cache for terrain collision.
pub struct CollisionGenerator {
    config: CollisionConfig,
    queue: Arc<JobQueue>,
    results: async_channel::Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    /// Keys queued or being built.
    pending: HashSet<CollisionKey>,
    shapes: HashMap<CollisionKey, Arc<HeightFieldShape>>,
    active: Option<CollisionKey>,
    attached: Option<(CollisionKey, BodyHandle)>,
    built: u64,
    failed: u64,
}

impl CollisionGenerator {
    /// Start `config.workers` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings or when a worker thread
    /// cannot be spawned.
    pub fn new(config: CollisionConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = async_channel::unbounded();
        let mut generator = Self {
            queue: Arc::new(JobQueue::default()),
            results: receiver,
            workers: Vec::with_capacity(config.workers),
            pending: HashSet::new(),
            shapes: HashMap::new(),
            active: None,
            attached: None,
            built: 0,
            failed: 0,
            config,
        };

        for index in 0..generator.config.workers {
            let queue = Arc::clone(&generator.queue);
            let results = sender.clone();
            let max_resolution = generator.config.max_resolution;
            let handle = std::thread::Builder::new()
                .name(format!("collision-{index}"))
                .spawn(move || collision_worker(&queue, &results, max_resolution))
                .map_err(|e| Error::Config {
                    context: "collision workers",
                    detail: format!("failed to spawn worker thread: {e}"),
                })?;
            generator.workers.push(handle);
        }

        tracing::debug!(workers = generator.config.workers, "Collision generator started");
        Ok(generator)
    }

    /// The generator's configuration.
    #[must_use]
    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Queue a shape build for `key` from a heightmap payload.
    ///
    /// Returns [`SubmitStatus::Cached`] without queueing when the shape is
    /// already built and [`SubmitStatus::Duplicate`] when a job for the key is
    /// already queued or running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] without an origin and
    /// [`Error::InvalidTile`] for a key outside the grid.
    pub fn submit(
        &mut self,
        key: CollisionKey,
        heightmap: Arc<TileData>,
        coords: &CoordinateSystem,
    ) -> Result<SubmitStatus> {
        if coords.origin().is_none() {
            return Err(Error::OriginUnset);
        }
        if !key.tile.is_valid() {
            return Err(Error::InvalidTile(key.tile));
        }
        if self.shapes.contains_key(&key) {
            return Ok(SubmitStatus::Cached);
        }
        if !self.pending.insert(key) {
            return Ok(SubmitStatus::Duplicate);
        }

        tracing::debug!(%key, "Queued collision job");
        self.queue.push(CollisionJob {
            key,
            heightmap,
            coords: *coords,
        });
        Ok(SubmitStatus::Queued)
    }

    /// Make `key` the active tile.
    ///
    /// Attaches its shape right away if cached; otherwise the current body
    /// stays attached until the new shape is built. Queued jobs and cached
    /// shapes outside the keep set are dropped, detaching the body if it is
    /// among them.
    pub fn set_active(&mut self, key: CollisionKey, physics: &mut dyn PhysicsWorld) {
        if self.active != Some(key) {
            tracing::debug!(%key, "Active collision tile changed");
            self.active = Some(key);
        }

        let dropped = self.queue.retain(|job| self.in_keep_set(job));
        for job in &dropped {
            self.pending.remove(job);
        }
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropped queued collision jobs");
        }

        self.evict(physics, true);

        let attached_key = self.attached.map(|(attached, _)| attached);
        if attached_key != Some(key)
            && let Some(shape) = self.shapes.get(&key).cloned()
        {
            self.install(&shape, physics);
        }
    }

    /// Apply finished jobs: cache their shapes and attach the active one.
    ///
    /// Must be called on the thread that owns `physics`.
    pub fn poll(&mut self, physics: &mut dyn PhysicsWorld) -> Vec<CollisionEvent> {
        let mut events = Vec::new();

        while let Ok(JobResult { key, result }) = self.results.try_recv() {
            self.pending.remove(&key);
            match result {
                Ok(shape) => {
                    self.built += 1;
                    let shape = Arc::new(shape);
                    self.shapes.insert(key, Arc::clone(&shape));
                    let attached = self.active == Some(key);
                    if attached {
                        self.install(&shape, physics);
                    } else {
                        tracing::debug!(%key, "Cached collision shape for inactive tile");
                    }
                    events.push(CollisionEvent::Built { key, attached });
                }
                Err(e) => {
                    self.failed += 1;
                    tracing::warn!(%key, "Collision shape build failed: {e}");
                    events.push(CollisionEvent::Failed {
                        key,
                        error: Arc::new(e),
                    });
                }
            }
        }

        if !events.is_empty() {
            self.evict(physics, false);
        }
        events
    }

    /// A cached shape.
    #[must_use]
    pub fn shape(&self, key: &CollisionKey) -> Option<Arc<HeightFieldShape>> {
        self.shapes.get(key).cloned()
    }

    /// The active key, if any.
    #[must_use]
    pub fn active(&self) -> Option<CollisionKey> {
        self.active
    }

    /// Key of the attached body, if any.
    #[must_use]
    pub fn attached(&self) -> Option<CollisionKey> {
        self.attached.map(|(key, _)| key)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CollisionStats {
        CollisionStats {
            cached: self.shapes.len(),
            queued: self.queue.len(),
            pending: self.pending.len(),
            built: self.built,
            failed: self.failed,
            attached: self.attached(),
        }
    }

    fn in_keep_set(&self, key: &CollisionKey) -> bool {
        let Some(active) = self.active else {
            return true;
        };
        key.positioning_zoom == active.positioning_zoom
            && active.tile.distance(&key.tile) <= self.config.keep_radius
    }

    /// Attach `shape`, then detach whatever body it replaces.
    fn install(&mut self, shape: &HeightFieldShape, physics: &mut dyn PhysicsWorld) {
        let body = physics.attach(shape);
        tracing::debug!(key = %shape.key, ?body, "Attached collision body");
        if let Some((old_key, old_body)) = self.attached.replace((shape.key, body)) {
            physics.detach(old_body);
            tracing::debug!(key = %old_key, body = ?old_body, "Detached collision body");
        }
    }

    /// Evict shapes outside the keep set (when `outside_keep_set` is set) and
    /// then the farthest shapes until the hard cap holds. The active shape is
    /// never evicted.
    fn evict(&mut self, physics: &mut dyn PhysicsWorld, outside_keep_set: bool) {
        let mut victims: Vec<CollisionKey> = if outside_keep_set {
            self.shapes
                .keys()
                .filter(|key| !self.in_keep_set(key))
                .copied()
                .collect()
        } else {
            Vec::new()
        };

        let remaining = self.shapes.len() - victims.len();
        if remaining > self.config.max_cached {
            let active = self.active;
            let mut candidates: Vec<CollisionKey> = self
                .shapes
                .keys()
                .filter(|key| Some(**key) != active && !victims.contains(*key))
                .copied()
                .collect();
            candidates.sort_by_key(|key| {
                let distance = active.map_or(0, |active| active.tile.distance(&key.tile));
                (Reverse(distance), *key)
            });
            victims.extend(candidates.into_iter().take(remaining - self.config.max_cached));
        }

        for key in victims {
            self.shapes.remove(&key);
            if let Some((attached, body)) = self.attached
                && attached == key
            {
                physics.detach(body);
                self.attached = None;
                tracing::debug!(%key, ?body, "Detached evicted collision body");
            }
            tracing::trace!(%key, "Evicted collision shape");
        }
    }
}

impl Drop for CollisionGenerator {
    fn drop(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Collision worker panicked");
            }
        }
    }
}

fn collision_worker(
    queue: &JobQueue,
    results: &async_channel::Sender<JobResult>,
    max_resolution: usize,
) {
    while let Some(job) = queue.pop() {
        let result = build_job(&job, max_resolution);
        if results
            .send_blocking(JobResult {
                key: job.key,
                result,
            })
            .is_err()
        {
            break;
        }
    }
}

fn build_job(job: &CollisionJob, max_resolution: usize) -> Result<HeightFieldShape> {
    let raster = job.heightmap.as_raster().ok_or_else(|| {
        Error::Decode(DecodeError::InvalidFormat {
            context: "collision heightmap",
            detail: "layer payload is not a raster".to_string(),
        })
    })?;
    HeightFieldShape::build(job.key, raster, &job.coords, max_resolution)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Attach(BodyHandle, CollisionKey),
        Detach(BodyHandle),
    }

    #[derive(Default)]
    struct RecordingPhysics {
        next: u64,
        calls: Vec<Call>,
    }

    impl PhysicsWorld for RecordingPhysics {
        fn attach(&mut self, shape: &HeightFieldShape) -> BodyHandle {
            self.next += 1;
            let body = BodyHandle(self.next);
            self.calls.push(Call::Attach(body, shape.key));
            body
        }

        fn detach(&mut self, body: BodyHandle) {
            self.calls.push(Call::Detach(body));
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn heightmap(size: u32) -> Arc<TileData> {
        let heights: Vec<f32> = (0..size * size).map(|i| 100.0 + i as f32).collect();
        Arc::new(TileData::Raster(Raster::from_heights(size, size, &heights).unwrap()))
    }

    fn key(x: i32, y: i32) -> CollisionKey {
        CollisionKey::new(TileKey::new(x, y, 14))
    }

    fn coords() -> CoordinateSystem {
        CoordinateSystem::with_origin(TileKey::new(10, 10, 14))
    }

    fn generator(keep_radius: u32, max_cached: usize) -> CollisionGenerator {
        CollisionGenerator::new(CollisionConfig {
            workers: 1,
            keep_radius,
            max_cached,
            ..CollisionConfig::default()
        })
        .unwrap()
    }

    fn poll_until(
        generator: &mut CollisionGenerator,
        physics: &mut RecordingPhysics,
        count: usize,
    ) -> Vec<CollisionEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(generator.poll(physics));
            std::thread::sleep(Duration::from_millis(2));
        }
        events
    }

    #[test]
    fn test_shape_scale_matches_tile_size() {
        let raster = Raster::from_heights(5, 5, &[10.0; 25]).unwrap();
        let shape = HeightFieldShape::build(key(10, 10), &raster, &coords(), 256).unwrap();

        let extent = tile_size_meters(14);
        assert_eq!((shape.width, shape.depth), (5, 5));
        assert!((shape.scale.x - extent / 4.0).abs() < 1e-9);
        assert!((shape.scale.z - extent / 4.0).abs() < 1e-9);
        assert!((shape.scale.y - 1.0).abs() < f64::EPSILON);
        assert!((shape.extent() - extent).abs() < 1e-6);
        assert!((shape.position.x - extent / 2.0).abs() < 1e-6);
        assert!((shape.position.z - extent / 2.0).abs() < 1e-6);
        assert!((shape.min_height - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_shape_position_follows_tile() {
        let raster = Raster::from_heights(4, 4, &[0.0; 16]).unwrap();
        let shape = HeightFieldShape::build(key(11, 9), &raster, &coords(), 256).unwrap();
        let extent = tile_size_meters(14);
        assert!((shape.position.x - 1.5 * extent).abs() < 1e-6);
        assert!((shape.position.z + 0.5 * extent).abs() < 1e-6);
    }

    #[test]
    fn test_shape_downsampled_to_cap() {
        let raster = Raster::from_heights(8, 8, &[5.0; 64]).unwrap();
        let shape = HeightFieldShape::build(key(10, 10), &raster, &coords(), 4).unwrap();
        assert_eq!((shape.width, shape.depth), (4, 4));
        assert_eq!(shape.heights.len(), 16);
        assert!((shape.scale.x - tile_size_meters(14) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_positioning_zoom_rejected() {
        let raster = Raster::from_heights(4, 4, &[0.0; 16]).unwrap();
        let key = CollisionKey {
            tile: TileKey::new(10, 10, 14),
            positioning_zoom: 13,
        };
        let result = HeightFieldShape::build(key, &raster, &coords(), 256);
        assert!(matches!(result, Err(Error::InvalidRegion { .. })));
    }

    #[test]
    fn test_height_bounds_ignore_spikes() {
        // 400 samples at 1000 m with a single 9000 m spike and a -500 m pit.
        let mut heights = vec![1000.0; 400];
        heights[17] = 9000.0;
        heights[230] = -500.0;
        let raster = Raster::from_heights(20, 20, &heights).unwrap();
        let shape = HeightFieldShape::build(key(10, 10), &raster, &coords(), 256).unwrap();
        assert!((shape.min_height - 1000.0).abs() < 0.01);
        assert!((shape.max_height - 1000.0).abs() < 0.01);
        assert_eq!(shape.heights.len(), 400);
    }

    #[test]
    fn test_submit_requires_origin() {
        let mut generator = generator(1, 9);
        let result = generator.submit(key(10, 10), heightmap(4), &CoordinateSystem::unset());
        assert!(matches!(result, Err(Error::OriginUnset)));
    }

    #[test]
    fn test_duplicate_jobs_dropped() {
        let mut generator = generator(1, 9);
        let mut physics = RecordingPhysics::default();
        let coords = coords();

        assert_eq!(
            generator.submit(key(10, 10), heightmap(4), &coords).unwrap(),
            SubmitStatus::Queued
        );
        assert_eq!(
            generator.submit(key(10, 10), heightmap(4), &coords).unwrap(),
            SubmitStatus::Duplicate
        );

        let events = poll_until(&mut generator, &mut physics, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(
            generator.submit(key(10, 10), heightmap(4), &coords).unwrap(),
            SubmitStatus::Cached
        );
        assert_eq!(generator.stats().built, 1);
    }

    #[test]
    fn test_superseded_job_cached_not_attached() {
        let mut generator = generator(1, 9);
        let mut physics = RecordingPhysics::default();

        generator.set_active(key(10, 10), &mut physics);
        generator.submit(key(10, 10), heightmap(4), &coords()).unwrap();
        // The observer moves on before the result is applied.
        generator.set_active(key(11, 10), &mut physics);

        let events = poll_until(&mut generator, &mut physics, 1);
        assert!(matches!(
            events.as_slice(),
            [CollisionEvent::Built { attached: false, .. }]
        ));
        assert!(generator.shape(&key(10, 10)).is_some());
        assert!(physics.calls.is_empty());
        assert_eq!(generator.attached(), None);
    }

    #[test]
    fn test_active_body_replaced_after_new_shape() {
        let mut generator = generator(1, 9);
        let mut physics = RecordingPhysics::default();
        let coords = coords();

        generator.set_active(key(10, 10), &mut physics);
        generator.submit(key(10, 10), heightmap(4), &coords).unwrap();
        poll_until(&mut generator, &mut physics, 1);
        assert_eq!(physics.calls, vec![Call::Attach(BodyHandle(1), key(10, 10))]);

        // The old body stays until the new shape exists.
        generator.set_active(key(11, 10), &mut physics);
        assert_eq!(generator.attached(), Some(key(10, 10)));
        generator.submit(key(11, 10), heightmap(4), &coords).unwrap();
        poll_until(&mut generator, &mut physics, 1);
        assert_eq!(
            physics.calls[1..],
            [
                Call::Attach(BodyHandle(2), key(11, 10)),
                Call::Detach(BodyHandle(1)),
            ]
        );

        // Moving back is a cache hit.
        generator.set_active(key(10, 10), &mut physics);
        assert_eq!(
            physics.calls[3..],
            [
                Call::Attach(BodyHandle(3), key(10, 10)),
                Call::Detach(BodyHandle(2)),
            ]
        );
        assert_eq!(generator.stats().built, 2);
    }

    #[test]
    fn test_eviction_detaches_body() {
        let mut generator = generator(0, 9);
        let mut physics = RecordingPhysics::default();

        generator.set_active(key(10, 10), &mut physics);
        generator.submit(key(10, 10), heightmap(4), &coords()).unwrap();
        poll_until(&mut generator, &mut physics, 1);

        generator.set_active(key(11, 10), &mut physics);
        assert!(generator.shape(&key(10, 10)).is_none());
        assert_eq!(generator.attached(), None);
        assert_eq!(physics.calls.last(), Some(&Call::Detach(BodyHandle(1))));
    }

    #[test]
    fn test_hard_cap_keeps_active() {
        let mut generator = generator(1, 2);
        let mut physics = RecordingPhysics::default();
        let coords = coords();

        generator.set_active(key(10, 10), &mut physics);
        for k in [key(10, 10), key(11, 10), key(11, 11)] {
            generator.submit(k, heightmap(4), &coords).unwrap();
        }
        poll_until(&mut generator, &mut physics, 3);

        assert!(generator.stats().cached <= 2);
        assert!(generator.shape(&key(10, 10)).is_some());
        assert_eq!(generator.attached(), Some(key(10, 10)));
    }

    #[test]
    fn test_queued_jobs_outside_keep_set_dropped() {
        let mut generator = generator(1, 9);
        let mut physics = RecordingPhysics::default();
        generator.set_active(key(10, 10), &mut physics);

        // Jump far away; whatever has not started yet is dropped.
        for x in 0..20 {
            generator.submit(key(x, 10), heightmap(4), &coords()).unwrap();
        }
        generator.set_active(key(100, 100), &mut physics);
        assert_eq!(generator.stats().queued, 0);

        // At most the job already running finishes, and it is not attached.
        std::thread::sleep(Duration::from_millis(50));
        let events = generator.poll(&mut physics);
        assert!(events.len() <= 1);
        assert!(physics.calls.is_empty());
        assert_eq!(generator.stats().pending, 0);
    }

    #[test]
    fn test_non_raster_payload_fails() {
        let mut generator = generator(1, 9);
        let mut physics = RecordingPhysics::default();
        let blob = Arc::new(TileData::Blob(vec![1, 2, 3]));
        generator.submit(key(10, 10), blob, &coords()).unwrap();

        let events = poll_until(&mut generator, &mut physics, 1);
        assert!(matches!(events.as_slice(), [CollisionEvent::Failed { .. }]));
        assert_eq!(generator.stats().failed, 1);
        assert!(generator.shape(&key(10, 10)).is_none());
    }
}
