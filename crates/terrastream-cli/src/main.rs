//! Headless terrain streaming driver.
//!
//! Places an observer above a geographic position, optionally lowers it each
//! tick, and logs what reaches the render and physics sinks. Useful for
//! warming a disk cache and for checking a layer configuration.

mod launch_params;
mod sinks;

use std::process::ExitCode;

use sinks::{LoggingPhysics, LoggingRender};
use terrastream::{StreamerConfig, TerrainStreamer};
use web_time::Instant;

use crate::launch_params::LaunchParams;

/// Height above the terrain at which a descent stops, in meters.
const MIN_CLEARANCE: f64 = 20.0;

fn run(params: &LaunchParams) -> terrastream::Result<()> {
    let mut config = match &params.config {
        Some(path) => StreamerConfig::load(path)?,
        None => StreamerConfig::default(),
    };
    if let Some(dir) = &params.cache_dir {
        config.cache.cache_dir = Some(dir.clone());
    }
    let tick_interval = config.tick_interval;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("terrastream-fetch")
        .enable_all()
        .build()
        .map_err(|e| terrastream::Error::Io {
            operation: "runtime start",
            message: e.to_string(),
        })?;

    let mut streamer = TerrainStreamer::with_http(
        config,
        runtime.handle(),
        LoggingRender::default(),
        LoggingPhysics::default(),
    )?;
    let mut observer = streamer
        .coords()
        .lat_lon_to_world(params.lat, params.lon, params.altitude)?;
    tracing::info!(
        lat = params.lat,
        lon = params.lon,
        altitude = params.altitude,
        x = observer.x,
        y = observer.y,
        z = observer.z,
        "Observer placed"
    );

    for tick in 0..params.ticks {
        if let Some(report) = streamer.update(observer, Instant::now())? {
            tracing::info!(
                tick,
                target = ?report.target,
                height = report.height_above_terrain,
                loaded = report.loaded,
                failed = report.failed,
                atlases = report.atlases_rebuilt,
                surfaces = report.tiles_applied,
                collision = report.collision_built,
                "Tick"
            );
        }
        std::thread::sleep(tick_interval);

        if params.descent > 0.0 {
            let floor = streamer.terrain_elevation_at(observer) + MIN_CLEARANCE;
            observer.y = (observer.y - params.descent).max(floor.min(observer.y));
        }
    }

    let cache = streamer.cache().stats();
    tracing::info!(
        memory = cache.memory_entries,
        queued = cache.queued,
        in_flight = cache.in_flight,
        failed = cache.failed,
        network = cache.network_fetches,
        disk = cache.disk_hits,
        evictions = cache.evictions,
        "Cache"
    );
    if let Some(collision) = streamer.collision() {
        let stats = collision.stats();
        tracing::info!(
            cached = stats.cached,
            built = stats.built,
            failed = stats.failed,
            attached = ?stats.attached,
            "Collision"
        );
    }
    tracing::info!(
        elevation = streamer.terrain_elevation_at(observer),
        tiles = streamer.render().tiles(),
        with_heightmap = streamer.render().tiles_with_heightmap(),
        atlases = streamer.render().atlases(),
        bodies = streamer.physics().bodies(),
        "Finished"
    );
    Ok(())
}

fn main() -> ExitCode {
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let params = launch_params::parse();
    match run(&params) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
