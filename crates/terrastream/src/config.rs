//! Streamer configuration.
//!
//! Every section deserializes from JSON with defaults for missing fields, so
//! a config file only needs to name what it changes. Durations are given in
//! seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::layer::LayerDescriptor;
use crate::tile::MAX_ZOOM;

/// Deserialize a non-negative number of seconds into a [`Duration`].
///
/// # Errors
///
/// Fails for negative, infinite or NaN values.
pub fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| serde::de::Error::custom(format!("invalid duration {secs}: {e}")))
}

/// Tile fetch pipeline settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TileCacheConfig {
    /// Root of the on-disk cache. `None` disables disk caching.
    pub cache_dir: Option<PathBuf>,
    /// Maximum number of tile keys held in memory.
    pub memory_capacity: usize,
    /// Number of concurrent fetch workers.
    pub fetch_workers: usize,
    /// Total attempts per (tile, layer) before a transient failure is terminal.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with each further attempt.
    #[serde(rename = "retry_backoff_secs", deserialize_with = "deserialize_secs")]
    pub retry_backoff: Duration,
    /// Upper bound on a single network request.
    #[serde(rename = "request_timeout_secs", deserialize_with = "deserialize_secs")]
    pub request_timeout: Duration,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            memory_capacity: 256,
            fetch_workers: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl TileCacheConfig {
    /// Check the settings for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity == 0 {
            return Err(config_error("memory_capacity", "must be at least 1"));
        }
        if self.fetch_workers == 0 {
            return Err(config_error("fetch_workers", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(config_error("max_attempts", "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(config_error("request_timeout", "must be positive"));
        }
        Ok(())
    }
}

/// Altitude to zoom mapping.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Zoom used at or above `max_height`.
    pub min_zoom: u8,
    /// Zoom used at or below `min_height`.
    pub max_zoom: u8,
    /// Height above terrain, in meters, at which the finest zoom starts.
    pub min_height: f64,
    /// Height above terrain, in meters, at which the coarsest zoom starts.
    pub max_height: f64,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            min_zoom: 10,
            max_zoom: 15,
            min_height: 50.0,
            max_height: 8000.0,
        }
    }
}

impl LodConfig {
    /// Check the settings for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.min_zoom > self.max_zoom {
            return Err(config_error(
                "lod zoom range",
                format!("min_zoom {} exceeds max_zoom {}", self.min_zoom, self.max_zoom),
            ));
        }
        if self.max_zoom > MAX_ZOOM {
            return Err(config_error(
                "lod zoom range",
                format!("max_zoom {} exceeds {MAX_ZOOM}", self.max_zoom),
            ));
        }
        if !(self.min_height.is_finite()
            && self.max_height.is_finite()
            && self.max_height > self.min_height)
        {
            return Err(config_error(
                "lod height range",
                format!(
                    "max_height {} must exceed min_height {}",
                    self.max_height, self.min_height
                ),
            ));
        }
        Ok(())
    }
}

/// Collision generation settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Whether collision shapes are generated at all.
    pub enabled: bool,
    /// Fixed zoom whose heightmap tiles become collision shapes.
    pub collision_zoom: u8,
    /// Number of worker threads.
    pub workers: usize,
    /// Largest height-field resolution per side; bigger rasters are resampled.
    pub max_resolution: usize,
    /// Rings of neighbours around the active tile whose shapes stay cached.
    pub keep_radius: u32,
    /// Hard cap on cached shapes.
    pub max_cached: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collision_zoom: 14,
            workers: 2,
            max_resolution: 256,
            keep_radius: 1,
            max_cached: 9,
        }
    }
}

impl CollisionConfig {
    /// Check the settings for values the generator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.collision_zoom > MAX_ZOOM {
            return Err(config_error(
                "collision_zoom",
                format!("{} exceeds {MAX_ZOOM}", self.collision_zoom),
            ));
        }
        if self.workers == 0 {
            return Err(config_error("collision workers", "must be at least 1"));
        }
        if self.max_resolution < 2 {
            return Err(config_error("max_resolution", "must be at least 2"));
        }
        if self.max_cached == 0 {
            return Err(config_error("max_cached", "must be at least 1"));
        }
        Ok(())
    }
}

/// Atlas compositing settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Edge length in pixels of each tile's slot in the atlas.
    pub region_size: u32,
    /// Layers composited into atlases for the render surface.
    pub layers: Vec<String>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            region_size: 256,
            layers: vec![crate::layer::HEIGHTMAP.to_string()],
        }
    }
}

/// Geographic origin of the local world frame.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OriginConfig {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Zoom of the origin tile.
    pub zoom: u8,
}

impl Default for OriginConfig {
    fn default() -> Self {
        // Jungfraujoch, with plenty of relief to stream.
        Self {
            lat: 46.5475,
            lon: 7.9853,
            zoom: 12,
        }
    }
}

/// Top-level configuration for a [`TerrainStreamer`](crate::TerrainStreamer).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Origin of the local world frame.
    pub origin: OriginConfig,
    /// Minimum time between orchestrator updates.
    #[serde(rename = "tick_interval_secs", deserialize_with = "deserialize_secs")]
    pub tick_interval: Duration,
    /// Rings of tiles around the observer that are streamed and composited.
    pub view_radius: u32,
    /// Registered tile layers.
    pub layers: Vec<LayerDescriptor>,
    /// Fetch pipeline settings.
    pub cache: TileCacheConfig,
    /// Altitude to zoom mapping.
    pub lod: LodConfig,
    /// Collision generation settings.
    pub collision: CollisionConfig,
    /// Atlas compositing settings.
    pub atlas: AtlasConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            origin: OriginConfig::default(),
            tick_interval: Duration::from_millis(250),
            view_radius: 1,
            layers: vec![LayerDescriptor::terrarium()],
            cache: TileCacheConfig::default(),
            lod: LodConfig::default(),
            collision: CollisionConfig::default(),
            atlas: AtlasConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or a value is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| config_error("configuration file", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or [`Error::Config`]
    /// if its contents are invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::Io {
            operation: "config read",
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.lod.validate()?;
        self.collision.validate()?;
        if self.atlas.region_size == 0 {
            return Err(config_error("atlas region_size", "must be positive"));
        }
        if self.origin.zoom > MAX_ZOOM {
            return Err(config_error(
                "origin zoom",
                format!("{} exceeds {MAX_ZOOM}", self.origin.zoom),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(config_error("tick_interval", "must be positive"));
        }
        Ok(())
    }
}

fn config_error(context: &'static str, detail: impl Into<String>) -> Error {
    Error::Config {
        context,
        detail: detail.into(),
    }
}
