//! Write-only interfaces to the renderer and the physics engine.
//!
//! The streamer never reads render or physics state back; it only hands
//! finished data to these collaborators on the thread that calls
//! [`TerrainStreamer::update`](crate::TerrainStreamer::update).

use std::sync::Arc;

use glam::Vec2;

use crate::atlas::Atlas;
use crate::cache::TileData;
use crate::collision::HeightFieldShape;
use crate::tile::TileKey;

/// Everything a terrain mesh needs to display one tile.
#[derive(Debug, Clone)]
pub struct TileSurface {
    /// The tile being displayed.
    pub key: TileKey,
    /// Heightmap raster, if loaded.
    pub heightmap: Option<Arc<TileData>>,
    /// Normal-map raster, if loaded.
    pub normal: Option<Arc<TileData>>,
    /// Edge length of the tile in meters.
    pub world_scale: f64,
    /// Top-left corner of the tile's region, normalized.
    pub uv_offset: Vec2,
    /// Size of the tile's region, normalized.
    pub uv_scale: Vec2,
    /// Slot in the heightmap atlas. When set, the UVs address the atlas last
    /// passed to [`RenderSurface::apply_atlas`]; otherwise they address
    /// `heightmap`, which may be a coarser ancestor of the tile.
    pub atlas_index: Option<usize>,
}

/// A mesh and material surface that accepts terrain data.
pub trait RenderSurface {
    /// Show `surface`, replacing whatever was shown for the same key.
    fn apply_tile(&mut self, surface: &TileSurface);

    /// Replace the composited atlas for `atlas.layer`.
    fn apply_atlas(&mut self, atlas: &Arc<Atlas>);
}

/// Opaque handle to a collision body owned by the physics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle(pub u64);

/// A physics world that accepts height-field colliders.
pub trait PhysicsWorld {
    /// Create a static body for `shape` and return its handle.
    fn attach(&mut self, shape: &HeightFieldShape) -> BodyHandle;

    /// Remove and free a body created by [`attach`](Self::attach).
    fn detach(&mut self, body: BodyHandle);
}

/// A render surface that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRender;

impl RenderSurface for NoRender {
    fn apply_tile(&mut self, _surface: &TileSurface) {}

    fn apply_atlas(&mut self, _atlas: &Arc<Atlas>) {}
}

/// A physics world without bodies. Handles are still unique so callers can
/// track attachment.
#[derive(Debug, Default, Clone)]
pub struct NoPhysics {
    next: u64,
}

impl PhysicsWorld for NoPhysics {
    fn attach(&mut self, _shape: &HeightFieldShape) -> BodyHandle {
        self.next += 1;
        BodyHandle(self.next)
    }

    fn detach(&mut self, _body: BodyHandle) {}
}
