//! Error types for decoding operations.

use std::fmt;

/// Errors that can occur while decoding tile payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input buffer is too small for the expected data.
    BufferTooSmall { expected: usize, actual: usize },
    /// The payload could not be decoded as an image.
    Image { detail: String },
    /// Invalid data format or structure.
    InvalidFormat {
        context: &'static str,
        detail: String,
    },
    /// The raster has no pixels.
    EmptyRaster,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { expected, actual } => {
                write!(
                    f,
                    "buffer too small: expected {expected} bytes, got {actual}"
                )
            }
            Self::Image { detail } => write!(f, "image decode failed: {detail}"),
            Self::InvalidFormat { context, detail } => {
                write!(f, "invalid format in {context}: {detail}")
            }
            Self::EmptyRaster => write!(f, "raster has no pixels"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<image::ImageError> for DecodeError {
    fn from(e: image::ImageError) -> Self {
        Self::Image {
            detail: e.to_string(),
        }
    }
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
