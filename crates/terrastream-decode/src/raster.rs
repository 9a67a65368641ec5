//! Decoded RGBA rasters.

use image::RgbaImage;

use crate::error::{DecodeError, DecodeResult};
use crate::terrarium::{decode_pixel, encode_height};

/// A decoded tile raster with 8-bit RGBA pixels, row 0 at the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    image: RgbaImage,
}

impl Raster {
    /// Wrap an already decoded image.
    #[must_use]
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Build a raster from tightly packed RGBA bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not exactly `width * height * 4` bytes.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> DecodeResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        let actual = data.len();
        RgbaImage::from_raw(width, height, data)
            .map(Self::new)
            .ok_or(DecodeError::BufferTooSmall { expected, actual })
    }

    /// Build a terrarium-encoded raster from row-major elevations in meters.
    ///
    /// # Errors
    ///
    /// Returns an error if `heights` does not hold `width * height` samples.
    pub fn from_heights(width: u32, height: u32, heights: &[f32]) -> DecodeResult<Self> {
        let expected = (width as usize) * (height as usize);
        if heights.len() != expected {
            return Err(DecodeError::BufferTooSmall {
                expected,
                actual: heights.len(),
            });
        }

        let mut data = Vec::with_capacity(expected * 4);
        for &h in heights {
            let [r, g, b] = encode_height(h);
            data.extend_from_slice(&[r, g, b, 255]);
        }
        Self::from_rgba(width, height, data)
    }

    /// A raster of one repeated pixel.
    #[must_use]
    pub fn filled(width: u32, height: u32, pixel: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, image::Rgba(pixel)))
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Whether the raster has no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// RGBA value of the pixel at `(x, y)`; `None` when out of bounds.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        self.image.get_pixel_checked(x, y).map(|p| p.0)
    }

    /// Decoded terrarium elevation at `(x, y)`; `None` when out of bounds.
    #[must_use]
    pub fn height_at(&self, x: u32, y: u32) -> Option<f32> {
        self.pixel(x, y).map(decode_pixel)
    }

    /// Borrow the underlying image.
    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Raw RGBA bytes, row-major.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Decode every pixel as a terrarium elevation, row-major.
    #[must_use]
    pub fn heights(&self) -> Vec<f32> {
        self.image.pixels().map(|p| decode_pixel(p.0)).collect()
    }
}

/// Decode a PNG, JPEG or WebP payload into an RGBA raster.
///
/// # Errors
///
/// Returns an error if the payload is empty, is not a supported image, or
/// decodes to an image without pixels.
pub fn decode_raster(bytes: &[u8]) -> DecodeResult<Raster> {
    if bytes.is_empty() {
        return Err(DecodeError::BufferTooSmall {
            expected: 1,
            actual: 0,
        });
    }

    let raster = Raster::new(image::load_from_memory(bytes)?.to_rgba8());
    if raster.is_empty() {
        return Err(DecodeError::EmptyRaster);
    }
    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_png(raster: &Raster) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        raster
            .image()
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_from_rgba_size_mismatch() {
        let result = Raster::from_rgba(2, 2, vec![0; 15]);
        assert!(matches!(
            result,
            Err(DecodeError::BufferTooSmall {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_from_heights_round_trips_through_pixels() {
        let raster = Raster::from_heights(2, 1, &[0.0, 100.5]).unwrap();
        assert_eq!(raster.height_at(0, 0), Some(0.0));
        assert_eq!(raster.height_at(1, 0), Some(100.5));
        assert_eq!(raster.height_at(2, 0), None);
    }

    #[test]
    fn test_decode_png_payload() {
        let source = Raster::from_heights(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let decoded = decode_raster(&encode_png(&source)).unwrap();
        assert_eq!(decoded, source);
        assert_eq!(decoded.heights(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_raster(&[0x00, 0x01, 0x02, 0x03]),
            Err(DecodeError::Image { .. })
        ));
        assert!(matches!(
            decode_raster(&[]),
            Err(DecodeError::BufferTooSmall { .. })
        ));
    }
}
