//! Multi-resolution texture atlases.
//!
//! An atlas packs one layer of a rectangular grid of same-zoom tiles into a
//! single raster, with a UV rectangle per tile. When the layer is only
//! served down to a coarser zoom, each tile's slot is cut out of its
//! ancestor at the layer's deepest native zoom: the ancestor is found by
//! shifting the tile index, and the tile's sub-square by masking it.
//!
//! Atlas UVs are in image space (`v = 0` at the top row), so heights are
//! sampled from an atlas with [`RasterLayout::Atlas`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::{UVec2, Vec2};
use image::RgbaImage;
use image::imageops::{self, FilterType};
use terrastream_decode::{Raster, RasterLayout, sample_bilinear};

use crate::cache::{TileCache, TileData, TileState};
use crate::config::AtlasConfig;
use crate::error::{Error, Result};
use crate::tile::TileKey;

/// Where one tile lives inside an atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasEntry {
    /// Top-left corner of the tile's region, normalized to the atlas size.
    pub uv_offset: Vec2,
    /// Size of the tile's region, normalized to the atlas size.
    pub uv_scale: Vec2,
    /// Row-major slot index within the grid.
    pub atlas_index: usize,
    /// Top-left corner of the region in pixels.
    pub pixel_origin: UVec2,
}

/// A composited raster and the location of each tile in it.
#[derive(Debug, Clone)]
pub struct Atlas {
    /// The composited layer.
    pub layer: String,
    /// Zoom of the tiles in the grid.
    pub zoom: u8,
    /// Zoom the pixels were taken from.
    pub source_zoom: u8,
    /// The composited image.
    pub image: Arc<Raster>,
    /// Edge length of each slot in pixels.
    pub region_size: u32,
    /// Grid size in slots.
    pub grid_size: UVec2,
    /// Placement of every tile that was composited.
    pub entries: HashMap<TileKey, AtlasEntry>,
    /// Source tiles the atlas was built from.
    pub sources: HashSet<TileKey>,
    /// Tiles that could not be composited.
    pub skipped: Vec<TileKey>,
}

impl Atlas {
    /// Whether the atlas was built from `source`, so that a reload of
    /// `source` invalidates it.
    #[must_use]
    pub fn depends_on(&self, source: TileKey) -> bool {
        self.sources.contains(&source)
    }

    /// Decoded elevation at a fractional position within `key`, with `(0, 0)`
    /// at the north-west corner and `(1, 1)` at the south-east corner.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sample_height(&self, key: TileKey, fx: f32, fy: f32) -> Option<f32> {
        let entry = self.entries.get(&key)?;
        let span = self.region_size.saturating_sub(1) as f32;
        let max_x = self.image.width().saturating_sub(1).max(1) as f32;
        let max_y = self.image.height().saturating_sub(1).max(1) as f32;
        let u = (entry.pixel_origin.x as f32 + fx.clamp(0.0, 1.0) * span) / max_x;
        let v = (entry.pixel_origin.y as f32 + fy.clamp(0.0, 1.0) * span) / max_y;
        sample_bilinear(&self.image, u, v, RasterLayout::Atlas)
    }
}

/// Outcome of [`AtlasCompositor::build`].
#[derive(Debug, Clone)]
pub enum AtlasBuild {
    /// Every source was available.
    Ready(Atlas),
    /// Some sources are still loading; they were requested and the build
    /// should be retried once they arrive.
    Pending {
        /// Source tiles that are not yet cached.
        missing: Vec<TileKey>,
    },
}

/// Builds atlases from cached tiles.
#[derive(Debug, Clone)]
pub struct AtlasCompositor {
    region_size: u32,
}

impl AtlasCompositor {
    /// Create a compositor producing `region_size` pixel slots.
    #[must_use]
    pub fn new(region_size: u32) -> Self {
        Self {
            region_size: region_size.max(1),
        }
    }

    /// Create a compositor from configuration.
    #[must_use]
    pub fn from_config(config: &AtlasConfig) -> Self {
        Self::new(config.region_size)
    }

    /// Slot edge length in pixels.
    #[must_use]
    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    /// Build an atlas of `layer` for `keys` from the tile cache.
    ///
    /// Missing sources are requested and the build returns
    /// [`AtlasBuild::Pending`]. Sources that failed terminally are left out,
    /// and the tiles depending on them are skipped.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown or disabled layer, an
    /// empty grid, or a grid mixing zooms.
    pub fn build(
        &self,
        cache: &mut TileCache,
        layer: &str,
        keys: &[TileKey],
    ) -> Result<AtlasBuild> {
        let descriptor = Arc::clone(cache.registry().get_enabled(layer)?);
        let zoom = grid_zoom(keys)?;
        let source_zoom = descriptor.source_zoom(zoom);
        let levels = zoom - source_zoom;

        let mut wanted: Vec<TileKey> = keys
            .iter()
            .filter(|key| key.is_valid())
            .map(|key| key.ancestor(levels))
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut sources = HashMap::new();
        let mut missing = Vec::new();
        for source in wanted {
            if let Some(data) = cache.get(source, layer) {
                sources.insert(source, data);
                continue;
            }
            if cache.state(source, layer) == TileState::Failed {
                continue;
            }
            match cache.request(source, layer) {
                Ok(_) => {
                    // A disk hit lands in memory synchronously.
                    if let Some(data) = cache.get(source, layer) {
                        sources.insert(source, data);
                    } else {
                        missing.push(source);
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %source, layer, "Atlas source request failed: {e}");
                }
            }
        }

        if !missing.is_empty() {
            tracing::debug!(
                layer,
                zoom,
                missing = missing.len(),
                "Atlas waiting on sources"
            );
            return Ok(AtlasBuild::Pending { missing });
        }

        self.compose(layer, keys, levels, &sources)
            .map(AtlasBuild::Ready)
    }

    /// Composite `keys` from already-loaded source tiles `levels` zooms
    /// coarser than the grid.
    ///
    /// Tiles whose source is missing, empty, not a raster, or not divisible
    /// into `2^levels` squares are skipped and listed in [`Atlas::skipped`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty grid or a grid mixing zooms.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn compose(
        &self,
        layer: &str,
        keys: &[TileKey],
        levels: u8,
        sources: &HashMap<TileKey, Arc<TileData>>,
    ) -> Result<Atlas> {
        let zoom = grid_zoom(keys)?;
        let levels = levels.min(zoom);
        let region = self.region_size;

        let mut grid_keys: Vec<TileKey> =
            keys.iter().copied().filter(TileKey::is_valid).collect();
        grid_keys.sort_unstable();
        grid_keys.dedup();

        // Unwrap columns across the antimeridian relative to the first key so
        // that a grid straddling it stays compact.
        let n = TileKey::tiles_per_side(zoom);
        let reference = i64::from(keys[0].x);
        let column = |key: &TileKey| {
            let x = i64::from(key.x);
            if x - reference > n / 2 {
                x - n
            } else if reference - x > n / 2 {
                x + n
            } else {
                x
            }
        };

        let min_x = grid_keys.iter().map(column).min().unwrap_or(0);
        let max_x = grid_keys.iter().map(column).max().unwrap_or(0);
        let min_y = grid_keys.iter().map(|k| i64::from(k.y)).min().unwrap_or(0);
        let max_y = grid_keys.iter().map(|k| i64::from(k.y)).max().unwrap_or(0);
        let grid_size = UVec2::new((max_x - min_x + 1) as u32, (max_y - min_y + 1) as u32);
        let atlas_size = grid_size * region;

        let mut image = RgbaImage::new(atlas_size.x, atlas_size.y);
        let mut entries = HashMap::new();
        let mut skipped = Vec::new();

        for key in &grid_keys {
            let slot = UVec2::new(
                (column(key) - min_x) as u32,
                (i64::from(key.y) - min_y) as u32,
            );
            let region_image = match extract_region(*key, levels, sources, region) {
                Ok(region_image) => region_image,
                Err(e) => {
                    tracing::warn!(%key, layer, "Skipping atlas tile: {e}");
                    skipped.push(*key);
                    continue;
                }
            };

            let origin = slot * region;
            imageops::replace(
                &mut image,
                &region_image,
                i64::from(origin.x),
                i64::from(origin.y),
            );
            entries.insert(
                *key,
                AtlasEntry {
                    uv_offset: origin.as_vec2() / atlas_size.as_vec2(),
                    uv_scale: Vec2::splat(region as f32) / atlas_size.as_vec2(),
                    atlas_index: (slot.y * grid_size.x + slot.x) as usize,
                    pixel_origin: origin,
                },
            );
        }

        let sources_used = grid_keys
            .iter()
            .map(|key| key.ancestor(levels))
            .filter(|source| sources.contains_key(source))
            .collect();

        tracing::debug!(
            layer,
            zoom,
            tiles = entries.len(),
            skipped = skipped.len(),
            width = atlas_size.x,
            height = atlas_size.y,
            "Atlas composited"
        );

        Ok(Atlas {
            layer: layer.to_string(),
            zoom,
            source_zoom: zoom - levels,
            image: Arc::new(Raster::new(image)),
            region_size: region,
            grid_size,
            entries,
            sources: sources_used,
            skipped,
        })
    }
}

/// The shared zoom of a non-empty grid.
fn grid_zoom(keys: &[TileKey]) -> Result<u8> {
    let Some(first) = keys.first() else {
        return Err(Error::Config {
            context: "atlas grid",
            detail: "no tiles requested".to_string(),
        });
    };
    if keys.iter().any(|key| key.zoom != first.zoom) {
        return Err(Error::Config {
            context: "atlas grid",
            detail: "tiles span more than one zoom".to_string(),
        });
    }
    Ok(first.zoom)
}

/// Cut the square covering `key` out of its ancestor and scale it to
/// `region` pixels.
fn extract_region(
    key: TileKey,
    levels: u8,
    sources: &HashMap<TileKey, Arc<TileData>>,
    region: u32,
) -> Result<RgbaImage> {
    let invalid = |detail: String| Error::InvalidRegion { key, detail };

    let parent_key = key.ancestor(levels);
    let parent = sources
        .get(&parent_key)
        .ok_or_else(|| invalid(format!("source tile {parent_key} is not loaded")))?;
    let parent = parent
        .as_raster()
        .ok_or_else(|| invalid(format!("source tile {parent_key} is not a raster")))?;
    if parent.is_empty() {
        return Err(invalid(format!("source tile {parent_key} is empty")));
    }

    let ratio = 1_u32 << levels;
    if parent.width() % ratio != 0 || parent.height() % ratio != 0 {
        return Err(invalid(format!(
            "source size {}x{} is not divisible by {ratio}",
            parent.width(),
            parent.height()
        )));
    }

    let sub = UVec2::new(parent.width() / ratio, parent.height() / ratio);
    let (ox, oy) = key.offset_in_ancestor(levels);
    let corner = UVec2::new(ox, oy) * sub;
    if corner.x + sub.x > parent.width() || corner.y + sub.y > parent.height() {
        return Err(invalid(format!(
            "region at {corner} exceeds source size {}x{}",
            parent.width(),
            parent.height()
        )));
    }

    let cropped = imageops::crop_imm(parent.image(), corner.x, corner.y, sub.x, sub.y).to_image();
    if sub == UVec2::splat(region) {
        Ok(cropped)
    } else {
        // Nearest keeps encoded elevations intact; blending RGB channels would
        // corrupt the terrarium encoding.
        Ok(imageops::resize(&cropped, region, region, FilterType::Nearest))
    }
}
