//! Render and physics collaborators that log what they receive.

use std::collections::HashMap;
use std::sync::Arc;

use terrastream::{
    Atlas, BodyHandle, CollisionKey, HeightFieldShape, PhysicsWorld, RenderSurface, TileKey,
    TileSurface,
};

/// Tracks the surfaces and atlases a renderer would be showing.
#[derive(Debug, Default)]
pub struct LoggingRender {
    surfaces: HashMap<TileKey, bool>,
    atlases: usize,
}

impl LoggingRender {
    /// Number of distinct tiles shown.
    #[must_use]
    pub fn tiles(&self) -> usize {
        self.surfaces.len()
    }

    /// Number of tiles shown with heightmap data.
    #[must_use]
    pub fn tiles_with_heightmap(&self) -> usize {
        self.surfaces.values().filter(|loaded| **loaded).count()
    }

    /// Number of atlases received.
    #[must_use]
    pub fn atlases(&self) -> usize {
        self.atlases
    }
}

impl RenderSurface for LoggingRender {
    fn apply_tile(&mut self, surface: &TileSurface) {
        tracing::trace!(
            key = %surface.key,
            heightmap = surface.heightmap.is_some(),
            atlas_index = ?surface.atlas_index,
            "Tile surface applied"
        );
        self.surfaces.insert(surface.key, surface.heightmap.is_some());
    }

    fn apply_atlas(&mut self, atlas: &Arc<Atlas>) {
        self.atlases += 1;
        tracing::info!(
            layer = atlas.layer,
            zoom = atlas.zoom,
            width = atlas.image.width(),
            height = atlas.image.height(),
            tiles = atlas.entries.len(),
            skipped = atlas.skipped.len(),
            "Atlas applied"
        );
    }
}

/// Hands out body handles and logs attachments.
#[derive(Debug, Default)]
pub struct LoggingPhysics {
    next: u64,
    bodies: HashMap<BodyHandle, CollisionKey>,
}

impl LoggingPhysics {
    /// Number of bodies currently attached.
    #[must_use]
    pub fn bodies(&self) -> usize {
        self.bodies.len()
    }
}

impl PhysicsWorld for LoggingPhysics {
    fn attach(&mut self, shape: &HeightFieldShape) -> BodyHandle {
        self.next += 1;
        let body = BodyHandle(self.next);
        self.bodies.insert(body, shape.key);
        tracing::info!(
            key = %shape.key,
            body = body.0,
            width = shape.width,
            depth = shape.depth,
            min_height = shape.min_height,
            max_height = shape.max_height,
            "Collision body attached"
        );
        body
    }

    fn detach(&mut self, body: BodyHandle) {
        if let Some(key) = self.bodies.remove(&body) {
            tracing::info!(%key, body = body.0, "Collision body detached");
        }
    }
}
