//! Height-field extraction for collision geometry.

use crate::error::{DecodeError, DecodeResult};
use crate::raster::Raster;
use crate::sample::{RasterLayout, sample_bilinear};

/// A square grid of elevations, row-major, row 0 at the north edge.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightField {
    /// Samples along the east-west axis.
    pub width: usize,
    /// Samples along the north-south axis.
    pub depth: usize,
    /// Elevations in meters, `depth` rows of `width` samples.
    pub heights: Vec<f32>,
}

impl HeightField {
    /// Extract a height-field from a raw terrarium tile.
    ///
    /// Uses the raster's native resolution when it fits within `max_resolution`
    /// samples per side, otherwise resamples the tile bilinearly down to
    /// `max_resolution`. Edge samples land exactly on the tile edges, so
    /// neighbouring tiles share their border elevations.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or non-square raster, or when fewer than
    /// two samples per side would remain.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_tile(raster: &Raster, max_resolution: usize) -> DecodeResult<Self> {
        if raster.is_empty() {
            return Err(DecodeError::EmptyRaster);
        }
        if raster.width() != raster.height() {
            return Err(DecodeError::InvalidFormat {
                context: "height-field",
                detail: format!(
                    "tile raster must be square, got {}x{}",
                    raster.width(),
                    raster.height()
                ),
            });
        }

        let resolution = (raster.width() as usize).min(max_resolution);
        if resolution < 2 {
            return Err(DecodeError::InvalidFormat {
                context: "height-field",
                detail: format!("resolution {resolution} is below the minimum of 2"),
            });
        }

        // Native resolution: copy decoded pixels directly.
        if resolution == raster.width() as usize {
            return Ok(Self {
                width: resolution,
                depth: resolution,
                heights: raster.heights(),
            });
        }

        let step = 1.0 / (resolution - 1) as f32;
        let mut heights = Vec::with_capacity(resolution * resolution);
        for row in 0..resolution {
            // Row 0 is north, which is v = 1 in tile UV space.
            let v = 1.0 - row as f32 * step;
            for col in 0..resolution {
                let u = col as f32 * step;
                let h = sample_bilinear(raster, u, v, RasterLayout::Tile)
                    .ok_or(DecodeError::EmptyRaster)?;
                heights.push(h);
            }
        }

        Ok(Self {
            width: resolution,
            depth: resolution,
            heights,
        })
    }

    /// Elevation at grid cell `(col, row)`.
    #[must_use]
    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.width || row >= self.depth {
            return None;
        }
        self.heights.get(row * self.width + col).copied()
    }

    /// Lowest and highest sample.
    #[must_use]
    pub fn bounds(&self) -> Option<(f32, f32)> {
        let mut iter = self.heights.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), h| (lo.min(h), hi.max(h))))
    }

    /// Spacing between samples for a tile footprint of `extent_meters`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_size(&self, extent_meters: f64) -> f64 {
        extent_meters / (self.width.saturating_sub(1).max(1)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_resolution_copies_pixels() {
        let raster = Raster::from_heights(2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let field = HeightField::from_tile(&raster, 256).unwrap();
        assert_eq!(field.width, 2);
        assert_eq!(field.depth, 2);
        // Row 0 is the top (north) row of the image.
        assert_eq!(field.get(0, 0), Some(1.0));
        assert_eq!(field.get(1, 1), Some(4.0));
        assert_eq!(field.get(2, 0), None);
    }

    #[test]
    fn test_downsample_keeps_corners() {
        let size = 5u32;
        let heights: Vec<f32> = (0..size * size).map(|i| i as f32).collect();
        let raster = Raster::from_heights(size, size, &heights).unwrap();

        let field = HeightField::from_tile(&raster, 3).unwrap();
        assert_eq!(field.width, 3);
        assert_eq!(field.heights.len(), 9);
        assert_eq!(field.get(0, 0), Some(0.0));
        assert_eq!(field.get(2, 0), Some(4.0));
        assert_eq!(field.get(0, 2), Some(20.0));
        assert_eq!(field.get(2, 2), Some(24.0));
        // Center of the 5x5 grid.
        assert_eq!(field.get(1, 1), Some(12.0));
    }

    #[test]
    fn test_rejects_non_square() {
        let raster = Raster::from_heights(2, 1, &[0.0, 0.0]).unwrap();
        assert!(matches!(
            HeightField::from_tile(&raster, 256),
            Err(DecodeError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_rejects_tiny_resolution() {
        let raster = Raster::from_heights(4, 4, &[0.0; 16]).unwrap();
        assert!(HeightField::from_tile(&raster, 1).is_err());
    }

    #[test]
    fn test_cell_size() {
        let raster = Raster::from_heights(5, 5, &[0.0; 25]).unwrap();
        let field = HeightField::from_tile(&raster, 256).unwrap();
        assert!((field.cell_size(100.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_bounds() {
        let raster = Raster::from_heights(2, 2, &[5.0, -2.0, 9.0, 0.0]).unwrap();
        let field = HeightField::from_tile(&raster, 256).unwrap();
        assert_eq!(field.bounds(), Some((-2.0, 9.0)));
    }
}
