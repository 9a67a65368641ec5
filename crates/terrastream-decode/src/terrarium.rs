//! Terrarium elevation codec.
//!
//! Elevation is packed into the RGB channels of a pixel as
//! `height = (R * 256 + G + B / 256) - 32768`, giving a range of roughly
//! -32768 m to +32768 m in steps of 1/256 m.

/// Offset added to elevations before packing.
const OFFSET: f64 = 32768.0;

/// Lowest representable elevation (an all-zero pixel).
pub const MIN_HEIGHT: f32 = -32768.0;

/// Highest representable elevation (an all-255 pixel).
pub const MAX_HEIGHT: f32 = 32_767.996_093_75;

/// Decode an elevation in meters from the three terrarium channels.
#[must_use]
pub fn decode_height(r: u8, g: u8, b: u8) -> f32 {
    f32::from(r) * 256.0 + f32::from(g) + f32::from(b) / 256.0 - 32768.0
}

/// Decode an elevation from an RGBA pixel, ignoring alpha.
#[must_use]
pub fn decode_pixel(pixel: [u8; 4]) -> f32 {
    decode_height(pixel[0], pixel[1], pixel[2])
}

/// Encode an elevation in meters into terrarium RGB channels.
///
/// Values outside the representable range are clamped. The encoding truncates
/// toward negative infinity, so `decode(encode(h))` is at most 1/256 m below `h`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_height(height: f32) -> [u8; 3] {
    let value = (f64::from(height) + OFFSET).clamp(0.0, 65535.0 + 255.0 / 256.0);
    let whole = value.floor();
    let fraction = value - whole;
    let whole = whole as u32;

    let r = (whole >> 8) as u8;
    let g = (whole & 0xff) as u8;
    let b = (fraction * 256.0).floor().min(255.0) as u8;
    [r, g, b]
}
