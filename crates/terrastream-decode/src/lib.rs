//! Decode terrarium-encoded elevation rasters and sample them.
//!
//! This crate provides pure synchronous functions for turning downloaded tile
//! payloads into RGBA rasters, decoding elevation values out of those rasters,
//! and extracting height-fields for collision. All functions can be called from
//! any threading context; the caller decides how to parallelize.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **User-controlled parallelism**: Callers decide where decoding runs
//! - **Decode before interpolate**: Encoded channels are never blended

mod error;
mod heightfield;
mod raster;
mod sample;
mod terrarium;

pub use error::{DecodeError, DecodeResult};
pub use heightfield::HeightField;
pub use raster::{Raster, decode_raster};
pub use sample::{RasterLayout, height_range, sample_bilinear};
pub use terrarium::{MAX_HEIGHT, MIN_HEIGHT, decode_height, decode_pixel, encode_height};
