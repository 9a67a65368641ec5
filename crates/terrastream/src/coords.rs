//! Coordinate conversion between geographic, tile-grid and world space.
//!
//! Geographic conversions use the Web-Mercator slippy-map formulas. World
//! space is a local planar frame anchored at a [`CoordinateSystem`] origin
//! tile so that positions stay small and precise far from the planet-wide
//! origin:
//!
//! - `+X` points east (increasing tile column),
//! - `+Z` points south (increasing tile row),
//! - `+Y` is elevation in meters.
//!
//! The origin is stored at its own zoom and rescaled to whatever zoom a
//! conversion uses, so the world position of a geographic point does not
//! depend on the zoom it was computed at. Tile *sizes* still halve per zoom
//! step, so any cached extent or scale is only valid for the zoom it was
//! computed for.

use std::f64::consts::PI;

use glam::{DVec2, DVec3};

use crate::error::{Error, Result};
use crate::tile::{MAX_ZOOM, TileKey};

/// Equatorial circumference of the WGS84 ellipsoid in meters.
pub const EARTH_CIRCUMFERENCE: f64 = 40_075_016.685_578_49;

/// Latitude limit of the square Web-Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Edge length of one tile at `zoom`, in meters at the equator.
#[must_use]
pub fn tile_size_meters(zoom: u8) -> f64 {
    EARTH_CIRCUMFERENCE / 2_f64.powi(i32::from(zoom))
}

/// Fractional tile coordinates of a geographic position.
///
/// Latitude is clamped to the projection limit.
#[must_use]
pub fn lat_lon_to_tile_fraction(lat: f64, lon: f64, zoom: u8) -> DVec2 {
    let n = 2_f64.powi(i32::from(zoom));
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;
    DVec2::new(x, y)
}

/// The tile containing a geographic position.
///
/// Longitudes wrap around the antimeridian and rows are clamped to the grid,
/// so the result is always a valid key.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn lat_lon_to_tile(lat: f64, lon: f64, zoom: u8) -> TileKey {
    let zoom = zoom.min(MAX_ZOOM);
    let fraction = lat_lon_to_tile_fraction(lat, lon, zoom);
    let n = TileKey::tiles_per_side(zoom);
    let x = (fraction.x.floor() as i64).rem_euclid(n);
    let y = (fraction.y.floor() as i64).clamp(0, n - 1);
    TileKey::new(x as i32, y as i32, zoom)
}

/// Geographic position of fractional tile coordinates, as `(lat, lon)`.
#[must_use]
pub fn tile_fraction_to_lat_lon(x: f64, y: f64, zoom: u8) -> (f64, f64) {
    let n = 2_f64.powi(i32::from(zoom));
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lat, lon)
}

/// Geographic position of a tile's north-west corner, as `(lat, lon)`.
#[must_use]
pub fn tile_to_lat_lon(key: TileKey) -> (f64, f64) {
    tile_fraction_to_lat_lon(f64::from(key.x), f64::from(key.y), key.zoom)
}

/// Geographic position of a tile's center, as `(lat, lon)`.
#[must_use]
pub fn tile_center_lat_lon(key: TileKey) -> (f64, f64) {
    tile_fraction_to_lat_lon(f64::from(key.x) + 0.5, f64::from(key.y) + 0.5, key.zoom)
}

/// Geographic extent of a tile in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub west: f64,
    pub east: f64,
}

impl GeoBounds {
    /// Whether `(lat, lon)` lies inside the bounds (edges inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.south..=self.north).contains(&lat) && (self.west..=self.east).contains(&lon)
    }
}

/// Geographic extent of a tile.
#[must_use]
pub fn tile_bounds(key: TileKey) -> GeoBounds {
    let (north, west) = tile_to_lat_lon(key);
    let (south, east) =
        tile_fraction_to_lat_lon(f64::from(key.x) + 1.0, f64::from(key.y) + 1.0, key.zoom);
    GeoBounds {
        north,
        south,
        west,
        east,
    }
}

/// A local world frame anchored at an origin tile.
///
/// Held by the orchestrator and passed to whatever needs world positions;
/// there is no process-wide origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinateSystem {
    origin: Option<TileKey>,
}

impl CoordinateSystem {
    /// A coordinate system without an origin. World conversions fail until
    /// [`set_origin`](Self::set_origin) is called.
    #[must_use]
    pub fn unset() -> Self {
        Self { origin: None }
    }

    /// A coordinate system anchored at the north-west corner of `origin`.
    #[must_use]
    pub fn with_origin(origin: TileKey) -> Self {
        Self {
            origin: Some(origin),
        }
    }

    /// A coordinate system anchored at the tile containing `(lat, lon)`.
    #[must_use]
    pub fn from_lat_lon(lat: f64, lon: f64, zoom: u8) -> Self {
        Self::with_origin(lat_lon_to_tile(lat, lon, zoom))
    }

    /// Replace the origin tile.
    pub fn set_origin(&mut self, origin: TileKey) {
        self.origin = Some(origin);
    }

    /// The origin tile, if set.
    #[must_use]
    pub fn origin(&self) -> Option<TileKey> {
        self.origin
    }

    /// Origin corner expressed in fractional tile units at `zoom`.
    fn origin_at(&self, zoom: u8) -> Result<DVec2> {
        let origin = self.origin.ok_or(Error::OriginUnset)?;
        let scale = 2_f64.powi(i32::from(zoom) - i32::from(origin.zoom));
        Ok(DVec2::new(f64::from(origin.x), f64::from(origin.y)) * scale)
    }

    /// World position of fractional tile coordinates at `zoom` (elevation 0).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn tile_fraction_to_world(&self, tile: DVec2, zoom: u8) -> Result<DVec3> {
        let relative = (tile - self.origin_at(zoom)?) * tile_size_meters(zoom);
        Ok(DVec3::new(relative.x, 0.0, relative.y))
    }

    /// World position of a tile's north-west corner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn try_tile_to_world(&self, key: TileKey) -> Result<DVec3> {
        self.tile_fraction_to_world(DVec2::new(f64::from(key.x), f64::from(key.y)), key.zoom)
    }

    /// World position of a tile's north-west corner, or the zero vector (with
    /// an error log) when no origin has been set.
    #[must_use]
    pub fn tile_to_world(&self, key: TileKey) -> DVec3 {
        match self.try_tile_to_world(key) {
            Ok(position) => position,
            Err(e) => {
                tracing::error!(%key, "Tile origin unavailable: {e}");
                DVec3::ZERO
            }
        }
    }

    /// World position of a tile's center.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn tile_center_to_world(&self, key: TileKey) -> Result<DVec3> {
        self.tile_fraction_to_world(
            DVec2::new(f64::from(key.x) + 0.5, f64::from(key.y) + 0.5),
            key.zoom,
        )
    }

    /// Fractional tile coordinates of a world position at `zoom`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn world_to_tile_fraction(&self, world: DVec3, zoom: u8) -> Result<DVec2> {
        let size = tile_size_meters(zoom);
        Ok(DVec2::new(world.x, world.z) / size + self.origin_at(zoom)?)
    }

    /// The tile containing a world position at `zoom`.
    ///
    /// Columns wrap around the antimeridian and rows are clamped to the grid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    #[allow(clippy::cast_possible_truncation)]
    pub fn world_to_tile(&self, world: DVec3, zoom: u8) -> Result<TileKey> {
        let zoom = zoom.min(MAX_ZOOM);
        let fraction = self.world_to_tile_fraction(world, zoom)?;
        let n = TileKey::tiles_per_side(zoom);
        let x = (fraction.x.floor() as i64).rem_euclid(n);
        let y = (fraction.y.floor() as i64).clamp(0, n - 1);
        Ok(TileKey::new(x as i32, y as i32, zoom))
    }

    /// World position of a geographic point at `altitude` meters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn lat_lon_to_world(&self, lat: f64, lon: f64, altitude: f64) -> Result<DVec3> {
        let zoom = self.origin.ok_or(Error::OriginUnset)?.zoom;
        let fraction = lat_lon_to_tile_fraction(lat, lon, zoom);
        let planar = self.tile_fraction_to_world(fraction, zoom)?;
        Ok(DVec3::new(planar.x, altitude, planar.z))
    }

    /// Geographic position `(lat, lon)` of a world position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OriginUnset`] if no origin has been set.
    pub fn world_to_lat_lon(&self, world: DVec3) -> Result<(f64, f64)> {
        let zoom = self.origin.ok_or(Error::OriginUnset)?.zoom;
        let fraction = self.world_to_tile_fraction(world, zoom)?;
        Ok(tile_fraction_to_lat_lon(fraction.x, fraction.y, zoom))
    }
}
