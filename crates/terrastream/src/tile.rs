//! Slippy-map tile keys.

use std::fmt;

/// Deepest zoom level accepted by the pipeline.
pub const MAX_ZOOM: u8 = 24;

/// Identifies one raster tile in the slippy-map grid.
///
/// Keys are ordered and hashable so they can index caches directly; the
/// string form `zoom/x/y` is stable and path-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Column, increasing eastward from the antimeridian.
    pub x: i32,
    /// Row, increasing southward from the north edge.
    pub y: i32,
    /// Zoom level.
    pub zoom: u8,
}

impl TileKey {
    /// Create a new tile key.
    #[must_use]
    pub const fn new(x: i32, y: i32, zoom: u8) -> Self {
        Self { x, y, zoom }
    }

    /// Number of tiles along one side of the grid at `zoom`.
    #[must_use]
    pub fn tiles_per_side(zoom: u8) -> i64 {
        1_i64 << zoom.min(MAX_ZOOM)
    }

    /// Whether the key lies inside the grid for its zoom.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.zoom > MAX_ZOOM {
            return false;
        }
        let n = Self::tiles_per_side(self.zoom);
        (0..n).contains(&i64::from(self.x)) && (0..n).contains(&i64::from(self.y))
    }

    /// The tile `levels` zooms coarser that contains this one.
    #[must_use]
    pub fn ancestor(&self, levels: u8) -> Self {
        let levels = levels.min(self.zoom);
        Self {
            x: self.x >> levels,
            y: self.y >> levels,
            zoom: self.zoom - levels,
        }
    }

    /// Position of this tile inside its ancestor `levels` zooms up, in units of
    /// this tile. Both components are in `0..2^levels`.
    #[must_use]
    pub fn offset_in_ancestor(&self, levels: u8) -> (u32, u32) {
        let levels = levels.min(self.zoom);
        let mask = (1_i32 << levels) - 1;
        #[allow(clippy::cast_sign_loss)]
        ((self.x & mask) as u32, (self.y & mask) as u32)
    }

    /// Chebyshev distance in tiles to a key at the same zoom.
    ///
    /// Keys at different zooms are treated as infinitely far apart.
    #[must_use]
    pub fn distance(&self, other: &Self) -> u32 {
        if self.zoom != other.zoom {
            return u32::MAX;
        }
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// All valid keys within `radius` tiles of this one, including itself.
    ///
    /// Columns wrap across the antimeridian; rows are clipped at the poles.
    /// Keys are returned row by row, north to south.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn neighborhood(&self, radius: u32) -> Vec<Self> {
        let n = Self::tiles_per_side(self.zoom);
        let r = i64::from(radius).min(n / 2);
        let mut keys = Vec::new();
        for dy in -r..=r {
            let y = i64::from(self.y) + dy;
            if !(0..n).contains(&y) {
                continue;
            }
            for dx in -r..=r {
                let x = (i64::from(self.x) + dx).rem_euclid(n);
                let key = Self::new(x as i32, y as i32, self.zoom);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Stable string form used for cache indexing.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}
