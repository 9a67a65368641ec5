//! Level of detail selection.
//!
//! Maps the observer's height above the terrain to a zoom level. Higher zoom
//! means more detail and is used closer to the ground.

use glam::DVec3;

use crate::config::LodConfig;
use crate::coords::CoordinateSystem;
use crate::error::Result;
use crate::tile::TileKey;

/// Chooses a zoom level from height above terrain.
#[derive(Debug, Clone)]
pub struct LodController {
    config: LodConfig,
}

impl LodController {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for an inverted zoom or
    /// height range.
    pub fn new(config: LodConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The controller's configuration.
    #[must_use]
    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    /// Zoom level for an observer `height_above_terrain` meters above the
    /// ground.
    ///
    /// Interpolates linearly from `max_zoom` at `min_height` down to
    /// `min_zoom` at `max_height` and rounds to the nearest zoom, with
    /// halfway cases going to the finer zoom. Heights outside the range (and
    /// below the ground) clamp to the ends; a NaN height selects the coarsest
    /// zoom.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn target_zoom(&self, height_above_terrain: f64) -> u8 {
        let LodConfig {
            min_zoom,
            max_zoom,
            min_height,
            max_height,
        } = self.config;
        if height_above_terrain.is_nan() {
            return min_zoom;
        }

        let span = max_height - min_height;
        let t = ((height_above_terrain - min_height) / span).clamp(0.0, 1.0);
        let zoom = f64::from(max_zoom) + (f64::from(min_zoom) - f64::from(max_zoom)) * t;
        (zoom.round() as u8).clamp(min_zoom, max_zoom)
    }

    /// The tile and zoom the observer should be streaming.
    ///
    /// `ground_elevation` is the terrain height under the observer; the zoom
    /// is chosen from the observer's height above it, not from its absolute
    /// altitude.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`](crate::Error::OriginUnset) if the
    /// coordinate system has no origin.
    pub fn target_tile(
        &self,
        coords: &CoordinateSystem,
        observer: DVec3,
        ground_elevation: f64,
    ) -> Result<TileKey> {
        let zoom = self.target_zoom(observer.y - ground_elevation);
        coords.world_to_tile(observer, zoom)
    }
}
