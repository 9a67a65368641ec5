//! Streaming orchestrator.
//!
//! [`TerrainStreamer`] ties the pipeline together. On every tick it drains
//! the tile and collision result queues, picks a target tile from the
//! observer's height above the terrain, requests the tiles around it,
//! rebuilds atlases whose sources changed, keeps the collision body on the
//! observer's tile and pushes finished data to the render and physics
//! collaborators. Everything here runs on the caller's thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::{DVec3, Vec2};
use terrastream_decode::{RasterLayout, sample_bilinear};
use tokio::runtime::Handle;
use web_time::Instant;

use crate::atlas::{Atlas, AtlasBuild, AtlasCompositor};
use crate::cache::{TileCache, TileData, TileEvent};
use crate::collision::{CollisionEvent, CollisionGenerator, CollisionKey};
use crate::config::StreamerConfig;
use crate::coords::{CoordinateSystem, tile_size_meters};
use crate::error::Result;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::layer::{HEIGHTMAP, LayerRegistry, NORMAL};
use crate::lod::LodController;
use crate::surface::{PhysicsWorld, RenderSurface, TileSurface};
use crate::tile::TileKey;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Tile the observer is streaming.
    pub target: Option<TileKey>,
    /// Whether the target changed this tick.
    pub retargeted: bool,
    /// Observer height above the sampled terrain, in meters.
    pub height_above_terrain: f64,
    /// Tile layers that finished loading.
    pub loaded: usize,
    /// Tile layers that failed terminally.
    pub failed: usize,
    /// Atlases rebuilt and handed to the renderer.
    pub atlases_rebuilt: usize,
    /// Tile surfaces handed to the renderer.
    pub tiles_applied: usize,
    /// Collision shapes built.
    pub collision_built: usize,
    /// Collision jobs that failed.
    pub collision_failed: usize,
}

/// Streams terrain around an observer into a renderer and a physics world.
pub struct TerrainStreamer<R, P> {
    config: StreamerConfig,
    coords: CoordinateSystem,
    cache: TileCache,
    lod: LodController,
    compositor: AtlasCompositor,
    collision: Option<CollisionGenerator>,
    render: R,
    physics: P,
    /// Target tile of the last retarget.
    active: Option<TileKey>,
    /// Tiles around the target.
    grid: Vec<TileKey>,
    /// (source tile, layer) pairs requested for the grid.
    requested: HashSet<(TileKey, String)>,
    atlases: HashMap<String, Arc<Atlas>>,
    /// Atlas layers to rebuild on this tick.
    stale_atlases: HashSet<String>,
    /// Sources a pending atlas build is waiting for, per layer.
    waiting: HashMap<String, HashSet<TileKey>>,
    /// Grid tiles whose surface must be re-sent to the renderer.
    dirty: HashSet<TileKey>,
    /// Heightmaps that loaded this tick.
    fresh_heightmaps: HashSet<TileKey>,
    last_tick: Option<Instant>,
}

impl<R: RenderSurface, P: PhysicsWorld> TerrainStreamer<R, P> {
    /// Create a streamer whose fetch workers run on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings, duplicate layers,
    /// or an atlas or collision setup that names an unregistered layer.
    pub fn new(
        config: StreamerConfig,
        fetcher: Arc<dyn Fetcher>,
        runtime: &Handle,
        render: R,
        physics: P,
    ) -> Result<Self> {
        config.validate()?;
        let registry = LayerRegistry::from_layers(config.layers.iter().cloned())?;
        if config.collision.enabled {
            registry.get(HEIGHTMAP)?;
        }
        for layer in &config.atlas.layers {
            registry.get(layer)?;
        }

        let coords = CoordinateSystem::from_lat_lon(
            config.origin.lat,
            config.origin.lon,
            config.origin.zoom,
        );
        let cache = TileCache::new(config.cache.clone(), registry, fetcher, runtime)?;
        let lod = LodController::new(config.lod.clone())?;
        let collision = if config.collision.enabled {
            Some(CollisionGenerator::new(config.collision.clone())?)
        } else {
            None
        };

        if let Some(origin) = coords.origin() {
            tracing::info!(%origin, "Terrain streamer ready");
        }

        Ok(Self {
            compositor: AtlasCompositor::from_config(&config.atlas),
            config,
            coords,
            cache,
            lod,
            collision,
            render,
            physics,
            active: None,
            grid: Vec::new(),
            requested: HashSet::new(),
            atlases: HashMap::new(),
            stale_atlases: HashSet::new(),
            waiting: HashMap::new(),
            dirty: HashSet::new(),
            fresh_heightmaps: HashSet::new(),
            last_tick: None,
        })
    }

    /// Create a streamer that fetches over HTTP with `reqwest`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new); also fails if the HTTP client cannot be built.
    pub fn with_http(
        config: StreamerConfig,
        runtime: &Handle,
        render: R,
        physics: P,
    ) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(config.cache.request_timeout)?);
        Self::new(config, fetcher, runtime, render, physics)
    }

    /// Run one tick for an observer at `observer` (world space).
    ///
    /// Returns `None` without doing anything if less than the configured tick
    /// interval has passed since the last tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`](crate::Error::OriginUnset) if the world
    /// frame has no origin.
    pub fn update(&mut self, observer: DVec3, now: Instant) -> Result<Option<TickReport>> {
        if let Some(last) = self.last_tick
            && now.saturating_duration_since(last) < self.config.tick_interval
        {
            return Ok(None);
        }
        self.last_tick = Some(now);

        let mut report = TickReport::default();
        self.fresh_heightmaps.clear();
        for event in self.cache.poll() {
            self.handle_event(event, &mut report);
        }

        let ground = self.terrain_elevation_at(observer);
        let target = self.lod.target_tile(&self.coords, observer, ground)?;
        report.target = Some(target);
        report.height_above_terrain = observer.y - ground;
        if self.active != Some(target) {
            self.retarget(target);
            report.retargeted = true;
        }

        self.rebuild_atlases(&mut report);
        self.update_collision(observer, &mut report)?;
        self.apply_dirty_tiles(&mut report);
        Ok(Some(report))
    }

    /// Terrain elevation under a world position, in meters.
    ///
    /// Samples the finest cached heightmap tile covering the position, then
    /// the heightmap atlas, and returns `0.0` when neither covers it. Never
    /// blocks and never requests tiles.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn terrain_elevation_at(&self, world: DVec3) -> f64 {
        let Ok(heightmap) = self.cache.registry().get(HEIGHTMAP) else {
            return 0.0;
        };

        let finest = self
            .config
            .lod
            .max_zoom
            .max(self.config.collision.collision_zoom);
        for zoom in (self.config.lod.min_zoom..=finest).rev() {
            // Zooms above the native ceiling share their ancestor's tile.
            if heightmap.source_zoom(zoom) != zoom {
                continue;
            }
            let (Ok(tile), Ok(fraction)) = (
                self.coords.world_to_tile(world, zoom),
                self.coords.world_to_tile_fraction(world, zoom),
            ) else {
                return 0.0;
            };
            let Some(data) = self.cache.peek(tile, HEIGHTMAP) else {
                continue;
            };
            let Some(raster) = data.as_raster() else {
                continue;
            };
            let fx = (fraction.x - fraction.x.floor()) as f32;
            let fy = (fraction.y - fraction.y.floor()) as f32;
            // Raw tiles put v = 1 on the north edge.
            if let Some(height) = sample_bilinear(raster, fx, 1.0 - fy, RasterLayout::Tile) {
                return f64::from(height);
            }
        }

        if let Some(atlas) = self.atlases.get(HEIGHTMAP)
            && let (Ok(tile), Ok(fraction)) = (
                self.coords.world_to_tile(world, atlas.zoom),
                self.coords.world_to_tile_fraction(world, atlas.zoom),
            )
        {
            let fx = (fraction.x - fraction.x.floor()) as f32;
            let fy = (fraction.y - fraction.y.floor()) as f32;
            if let Some(height) = atlas.sample_height(tile, fx, fy) {
                return f64::from(height);
            }
        }
        0.0
    }

    /// The world frame.
    #[must_use]
    pub fn coords(&self) -> &CoordinateSystem {
        &self.coords
    }

    /// The configuration the streamer was created with.
    #[must_use]
    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// The tile cache.
    #[must_use]
    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// The tile cache, for runtime layer changes.
    pub fn cache_mut(&mut self) -> &mut TileCache {
        &mut self.cache
    }

    /// The collision generator, if collision is enabled.
    #[must_use]
    pub fn collision(&self) -> Option<&CollisionGenerator> {
        self.collision.as_ref()
    }

    /// The current target tile.
    #[must_use]
    pub fn active_tile(&self) -> Option<TileKey> {
        self.active
    }

    /// Tiles around the current target.
    #[must_use]
    pub fn grid(&self) -> &[TileKey] {
        &self.grid
    }

    /// The last atlas built for `layer`.
    #[must_use]
    pub fn atlas(&self, layer: &str) -> Option<&Arc<Atlas>> {
        self.atlases.get(layer)
    }

    /// The render collaborator.
    #[must_use]
    pub fn render(&self) -> &R {
        &self.render
    }

    /// The physics collaborator.
    #[must_use]
    pub fn physics(&self) -> &P {
        &self.physics
    }

    fn handle_event(&mut self, event: TileEvent, report: &mut TickReport) {
        match event {
            TileEvent::Loaded { key, layer, .. } => {
                report.loaded += 1;
                if layer == HEIGHTMAP {
                    self.fresh_heightmaps.insert(key);
                }
                self.invalidate_atlas(&layer, key);
                self.dirty.extend(
                    self.grid
                        .iter()
                        .filter(|tile| covers(key, **tile))
                        .copied(),
                );
            }
            TileEvent::LoadFailed { key, layer, error } => {
                report.failed += 1;
                tracing::debug!(%key, layer, "Tile unavailable: {error}");
                self.invalidate_atlas(&layer, key);
            }
        }
    }

    fn invalidate_atlas(&mut self, layer: &str, source: TileKey) {
        let awaited = self
            .waiting
            .get(layer)
            .is_some_and(|missing| missing.contains(&source));
        let used = self
            .atlases
            .get(layer)
            .is_some_and(|atlas| atlas.depends_on(source));
        if awaited || used {
            self.stale_atlases.insert(layer.to_string());
        }
    }

    fn retarget(&mut self, target: TileKey) {
        let grid = target.neighborhood(self.config.view_radius);

        let mut wanted = HashSet::new();
        for descriptor in self.cache.registry().iter().filter(|d| d.enabled) {
            for key in &grid {
                let levels = key.zoom - descriptor.source_zoom(key.zoom);
                wanted.insert((key.ancestor(levels), descriptor.layer_type.clone()));
            }
        }

        let mut cancelled = 0;
        for (key, layer) in self.requested.difference(&wanted) {
            if self.cache.cancel(*key, layer) {
                cancelled += 1;
            }
        }
        for (key, layer) in &wanted {
            if let Err(e) = self.cache.request(*key, layer) {
                tracing::warn!(%key, layer, "Tile request failed: {e}");
            }
        }

        tracing::info!(
            %target,
            tiles = grid.len(),
            requests = wanted.len(),
            cancelled,
            "Streaming target changed"
        );

        self.requested = wanted;
        self.dirty = grid.iter().copied().collect();
        self.grid = grid;
        self.active = Some(target);
        self.waiting.clear();
        self.stale_atlases = self.config.atlas.layers.iter().cloned().collect();
    }

    fn rebuild_atlases(&mut self, report: &mut TickReport) {
        if self.grid.is_empty() {
            return;
        }
        let layers: Vec<String> = self.stale_atlases.drain().collect();
        for layer in layers {
            match self.compositor.build(&mut self.cache, &layer, &self.grid) {
                Ok(AtlasBuild::Ready(atlas)) => {
                    let atlas = Arc::new(atlas);
                    self.render.apply_atlas(&atlas);
                    self.dirty.extend(atlas.entries.keys().copied());
                    self.waiting.remove(&layer);
                    tracing::debug!(
                        layer,
                        zoom = atlas.zoom,
                        tiles = atlas.entries.len(),
                        skipped = atlas.skipped.len(),
                        "Atlas rebuilt"
                    );
                    self.atlases.insert(layer, atlas);
                    report.atlases_rebuilt += 1;
                }
                Ok(AtlasBuild::Pending { missing }) => {
                    self.waiting.insert(layer, missing.into_iter().collect());
                }
                Err(e) => {
                    tracing::warn!(layer, "Atlas build failed: {e}");
                }
            }
        }
    }

    fn update_collision(&mut self, observer: DVec3, report: &mut TickReport) -> Result<()> {
        let Some(generator) = self.collision.as_mut() else {
            return Ok(());
        };

        // Heightmap layers capped below the collision zoom are read at their
        // deepest native zoom; the shape then covers that coarser tile.
        let collision_zoom = generator.config().collision_zoom;
        let source_zoom = self
            .cache
            .registry()
            .get(HEIGHTMAP)?
            .source_zoom(collision_zoom);
        let tile = self
            .coords
            .world_to_tile(observer, collision_zoom)?
            .ancestor(collision_zoom.saturating_sub(source_zoom));
        let key = CollisionKey::new(tile);
        let moved = generator.active() != Some(key);
        if moved {
            generator.set_active(key, &mut self.physics);
        }

        // Submit once per activation or heightmap load, so a failed build is
        // not retried every tick.
        if (moved || self.fresh_heightmaps.contains(&tile)) && generator.shape(&key).is_none() {
            match self.cache.get(tile, HEIGHTMAP) {
                Some(heightmap) => {
                    if let Err(e) = generator.submit(key, heightmap, &self.coords) {
                        tracing::warn!(%key, "Collision submit failed: {e}");
                    }
                }
                None => {
                    if let Err(e) = self.cache.request(tile, HEIGHTMAP) {
                        tracing::warn!(%tile, "Collision heightmap request failed: {e}");
                    }
                }
            }
        }

        for event in generator.poll(&mut self.physics) {
            match event {
                CollisionEvent::Built { .. } => report.collision_built += 1,
                CollisionEvent::Failed { .. } => report.collision_failed += 1,
            }
        }
        Ok(())
    }

    fn apply_dirty_tiles(&mut self, report: &mut TickReport) {
        let dirty: Vec<TileKey> = self.dirty.drain().collect();
        for key in dirty {
            if !self.grid.contains(&key) {
                continue;
            }
            let surface = self.surface(key);
            self.render.apply_tile(&surface);
            report.tiles_applied += 1;
        }
    }

    /// Surface data for a grid tile.
    ///
    /// UVs address the heightmap atlas when the tile is in it, and the
    /// tile's square of `heightmap` otherwise.
    #[allow(clippy::cast_precision_loss)]
    fn surface(&self, key: TileKey) -> TileSurface {
        let heightmap = self.source_tile(key, HEIGHTMAP);
        let normal = self.source_tile(key, NORMAL).map(|(data, _)| data);

        let atlas_entry = self
            .atlases
            .get(HEIGHTMAP)
            .and_then(|atlas| atlas.entries.get(&key));
        let (uv_offset, uv_scale) = match (atlas_entry, &heightmap) {
            (Some(entry), _) => (entry.uv_offset, entry.uv_scale),
            (None, Some((_, levels))) => {
                let (dx, dy) = key.offset_in_ancestor(*levels);
                let scale = 1.0 / (1_u32 << levels) as f32;
                (
                    Vec2::new(dx as f32 * scale, dy as f32 * scale),
                    Vec2::splat(scale),
                )
            }
            (None, None) => (Vec2::ZERO, Vec2::ONE),
        };

        TileSurface {
            key,
            heightmap: heightmap.map(|(data, _)| data),
            normal,
            world_scale: tile_size_meters(key.zoom),
            uv_offset,
            uv_scale,
            atlas_index: atlas_entry.map(|entry| entry.atlas_index),
        }
    }

    /// The cached tile serving `layer` for `key`, and how many zooms coarser
    /// it is.
    fn source_tile(&self, key: TileKey, layer: &str) -> Option<(Arc<TileData>, u8)> {
        let descriptor = self.cache.registry().get_enabled(layer).ok()?;
        let levels = key.zoom - descriptor.source_zoom(key.zoom);
        let data = self.cache.peek(key.ancestor(levels), layer)?;
        Some((data, levels))
    }
}

/// Whether `source` is `tile` or one of its ancestors.
fn covers(source: TileKey, tile: TileKey) -> bool {
    source.zoom <= tile.zoom && tile.ancestor(tile.zoom - source.zoom) == source
}
