//! Error types for the terrastream crate.

use std::fmt;

use crate::tile::TileKey;

/// Result type for terrastream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How an error is handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, transport failure or non-2xx status. Retried with backoff.
    Transient,
    /// Corrupt or unexpected payload. Never retried.
    Decode,
    /// Missing or expired credentials. One refresh-and-retry cycle.
    Auth,
    /// Bad tile index, atlas region or compositing input. The tile is skipped.
    Geometry,
    /// Setup bug such as an unset origin or an unregistered layer. Fails fast.
    Configuration,
}

/// Errors that can occur in terrastream operations.
#[derive(Debug)]
pub enum Error {
    /// HTTP request failed at the transport level.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// The request did not complete within the configured timeout.
    Timeout {
        /// The URL that timed out.
        url: String,
    },
    /// Payload decoding failed.
    Decode(terrastream_decode::DecodeError),
    /// Credentials were missing, expired, or could not be refreshed.
    Auth {
        /// The layer whose token was rejected.
        layer: String,
        /// Description of the failure.
        detail: String,
    },
    /// A filesystem or runtime operation failed.
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// The error message.
        message: String,
    },
    /// The layer was never registered.
    UnknownLayer(String),
    /// The layer is registered but currently disabled.
    LayerDisabled(String),
    /// A world-space conversion was attempted before the origin was set.
    OriginUnset,
    /// Tile coordinates outside the grid for their zoom.
    InvalidTile(TileKey),
    /// An atlas source region could not be extracted.
    InvalidRegion {
        /// The tile whose region was requested.
        key: TileKey,
        /// Description of what was invalid.
        detail: String,
    },
    /// Invalid configuration value.
    Config {
        /// The offending setting.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
}

impl Error {
    /// Classify the error for retry and propagation decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Http { .. } | Error::HttpStatus { .. } | Error::Timeout { .. } => {
                ErrorClass::Transient
            }
            Error::Decode(_) | Error::Io { .. } => ErrorClass::Decode,
            Error::Auth { .. } => ErrorClass::Auth,
            Error::InvalidTile(_) | Error::InvalidRegion { .. } => ErrorClass::Geometry,
            Error::UnknownLayer(_)
            | Error::LayerDisabled(_)
            | Error::OriginUnset
            | Error::Config { .. } => ErrorClass::Configuration,
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Timeout { url } => write!(f, "http request to {url} timed out"),
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Auth { layer, detail } => {
                write!(f, "authentication for layer '{layer}' failed: {detail}")
            }
            Error::Io { operation, message } => {
                write!(f, "{operation} failed: {message}")
            }
            Error::UnknownLayer(layer) => write!(f, "layer '{layer}' is not registered"),
            Error::LayerDisabled(layer) => write!(f, "layer '{layer}' is disabled"),
            Error::OriginUnset => write!(f, "coordinate origin has not been set"),
            Error::InvalidTile(key) => write!(f, "tile {key} is outside the grid"),
            Error::InvalidRegion { key, detail } => {
                write!(f, "invalid atlas region for tile {key}: {detail}")
            }
            Error::Config { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<terrastream_decode::DecodeError> for Error {
    fn from(e: terrastream_decode::DecodeError) -> Self {
        Error::Decode(e)
    }
}
