//! Streaming, caching and level-of-detail engine for slippy-map terrain tiles.
//!
//! This crate streams elevation, normal and imagery tiles around an observer,
//! caches them in memory and on disk, composites them into atlases, picks a
//! zoom level from the observer's height above the terrain, and turns
//! heightmaps into height-field collision shapes.
//!
//! # Design principles
//!
//! - **Single main context**: Caches, atlases and collision bodies are only
//!   mutated by the thread that calls [`TerrainStreamer::update`]
//! - **Message passing**: Fetch and collision workers hand results back
//!   through channels drained once per tick
//! - **Write-only collaborators**: Renderers and physics engines plug in
//!   through [`RenderSurface`] and [`PhysicsWorld`]
//!
//! # Example
//!
//! ```ignore
//! use terrastream::{NoPhysics, NoRender, StreamerConfig, TerrainStreamer};
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let config = StreamerConfig::default();
//! let mut streamer =
//!     TerrainStreamer::with_http(config, runtime.handle(), NoRender, NoPhysics::default())?;
//!
//! let observer = streamer.coords().lat_lon_to_world(46.5475, 7.9853, 4500.0)?;
//! streamer.update(observer, web_time::Instant::now())?;
//! ```

pub mod atlas;
mod auth;
pub mod cache;
pub mod collision;
pub mod config;
pub mod coords;
mod disk;
mod error;
mod fetch;
pub mod layer;
pub mod lod;
mod memory;
mod queue;
mod streamer;
pub mod surface;
mod tile;

pub use atlas::{Atlas, AtlasBuild, AtlasCompositor, AtlasEntry};
pub use auth::{TokenGrant, TokenStore};
pub use cache::{
    CacheStats, RequestStatus, TileCache, TileData, TileEvent, TileLayers, TileState,
};
pub use collision::{
    CollisionEvent, CollisionGenerator, CollisionKey, CollisionStats, HeightFieldShape,
    SubmitStatus,
};
pub use config::{
    AtlasConfig, CollisionConfig, LodConfig, OriginConfig, StreamerConfig, TileCacheConfig,
};
pub use coords::{CoordinateSystem, GeoBounds};
pub use disk::DiskCache;
pub use error::{Error, ErrorClass, Result};
pub use fetch::{FetchFuture, FetchResponse, Fetcher, HttpFetcher};
pub use layer::{LayerAuth, LayerDescriptor, LayerRegistry};
pub use lod::LodController;
pub use memory::MemoryCache;
pub use queue::{DownloadTask, FetchQueue, RETRY_PRIORITY};
pub use streamer::{TerrainStreamer, TickReport};
pub use surface::{BodyHandle, NoPhysics, NoRender, PhysicsWorld, RenderSurface, TileSurface};
pub use tile::{MAX_ZOOM, TileKey};

// Re-export decode types for convenience.
pub use terrastream_decode::{Raster, RasterLayout, decode_height, encode_height};
