//! Elevation sampling over terrarium rasters.
//!
//! Image rows run top to bottom while tile UVs put `v = 0` at the bottom
//! (south) edge. A raw tile therefore needs its `v` flipped before it is
//! mapped to pixel rows. Atlas UVs are produced in image space by the
//! compositor, so atlas sampling must not flip again.

use crate::raster::Raster;

/// How UVs map onto the rows of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterLayout {
    /// A single raw tile: `v = 0` is the bottom row, so `v` is flipped.
    Tile,
    /// An atlas-composited raster: `v = 0` is the top row, no flip.
    Atlas,
}

/// Bilinearly interpolate the decoded elevation at normalized `(u, v)`.
///
/// UVs are clamped to `[0, 1]` and map to pixel centers at the raster edges.
/// Channels are decoded before interpolation. Returns `None` for an empty
/// raster.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sample_bilinear(raster: &Raster, u: f32, v: f32, layout: RasterLayout) -> Option<f32> {
    if raster.is_empty() {
        return None;
    }

    let max_x = raster.width() - 1;
    let max_y = raster.height() - 1;

    let u = u.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    let row = match layout {
        RasterLayout::Tile => 1.0 - v,
        RasterLayout::Atlas => v,
    };

    let fx = u * max_x as f32;
    let fy = row * max_y as f32;

    let x0 = (fx.floor() as u32).min(max_x);
    let y0 = (fy.floor() as u32).min(max_y);
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let tx = fx - x0 as f32;
    let ty = fy - y0 as f32;

    let h00 = raster.height_at(x0, y0)?;
    let h10 = raster.height_at(x1, y0)?;
    let h01 = raster.height_at(x0, y1)?;
    let h11 = raster.height_at(x1, y1)?;

    let top = h00 + (h10 - h00) * tx;
    let bottom = h01 + (h11 - h01) * tx;
    Some(top + (bottom - top) * ty)
}

/// Minimum and maximum elevation after trimming outliers.
///
/// All samples are decoded and sorted, then `trim_percent / 2` percent are
/// discarded from each tail so isolated encoding artifacts do not blow out
/// bounding volumes. At least one sample always survives. Returns `None` for
/// an empty raster.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn height_range(raster: &Raster, trim_percent: f32) -> Option<(f32, f32)> {
    let mut samples = raster.heights();
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f32::total_cmp);

    let count = samples.len();
    let fraction = f64::from(trim_percent.clamp(0.0, 100.0)) / 100.0 / 2.0;
    let trim = ((count as f64 * fraction).floor() as usize).min((count - 1) / 2);

    Some((samples[trim], samples[count - 1 - trim]))
}
