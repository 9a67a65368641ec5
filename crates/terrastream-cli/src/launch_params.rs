//! Launch parameter parsing for the headless driver.

use std::path::PathBuf;

use clap::Parser;

/// Default observer latitude (Jungfraujoch).
const DEFAULT_LAT: f64 = 46.5475;
/// Default observer longitude (Jungfraujoch).
const DEFAULT_LON: f64 = 7.9853;
/// Default observer altitude in meters.
const DEFAULT_ALTITUDE: f64 = 4500.0;
/// Default number of ticks to run.
const DEFAULT_TICKS: u32 = 40;
/// Default descent per tick in meters.
const DEFAULT_DESCENT: f64 = 0.0;

/// Launch parameters for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParams {
    /// JSON configuration file; defaults are used when absent.
    pub config: Option<PathBuf>,
    /// Observer latitude in degrees.
    pub lat: f64,
    /// Observer longitude in degrees.
    pub lon: f64,
    /// Observer altitude above sea level in meters.
    pub altitude: f64,
    /// Number of ticks to run before exiting.
    pub ticks: u32,
    /// Meters the observer descends each tick, stopping just above the
    /// terrain.
    pub descent: f64,
    /// Overrides the configured disk cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            config: None,
            lat: DEFAULT_LAT,
            lon: DEFAULT_LON,
            altitude: DEFAULT_ALTITUDE,
            ticks: DEFAULT_TICKS,
            descent: DEFAULT_DESCENT,
            cache_dir: None,
        }
    }
}

#[derive(Parser)]
#[command(about = "Stream terrain tiles around a descending observer")]
struct CliArgs {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Observer latitude in degrees.
    #[arg(long, default_value_t = DEFAULT_LAT, allow_negative_numbers = true)]
    lat: f64,

    /// Observer longitude in degrees.
    #[arg(long, default_value_t = DEFAULT_LON, allow_negative_numbers = true)]
    lon: f64,

    /// Observer altitude above sea level in meters.
    #[arg(long, default_value_t = DEFAULT_ALTITUDE, allow_negative_numbers = true)]
    altitude: f64,

    /// Number of ticks to run.
    #[arg(long, default_value_t = DEFAULT_TICKS)]
    ticks: u32,

    /// Meters to descend each tick.
    #[arg(long, default_value_t = DEFAULT_DESCENT)]
    descent: f64,

    /// Disk cache directory, overriding the configuration file.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl From<CliArgs> for LaunchParams {
    fn from(args: CliArgs) -> Self {
        Self {
            config: args.config,
            lat: args.lat,
            lon: args.lon,
            altitude: args.altitude,
            ticks: args.ticks,
            descent: args.descent,
            cache_dir: args.cache_dir,
        }
    }
}

/// Parse launch parameters from the command line.
pub fn parse() -> LaunchParams {
    CliArgs::parse().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from(args: &[&str]) -> LaunchParams {
        let argv = std::iter::once("terrastream-cli").chain(args.iter().copied());
        CliArgs::parse_from(argv).into()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(parse_from(&[]), LaunchParams::default());
    }

    #[test]
    fn test_overrides() {
        let params = parse_from(&[
            "--lat",
            "-33.86",
            "--lon",
            "151.21",
            "--altitude",
            "300",
            "--ticks",
            "5",
            "--descent",
            "25",
            "--cache-dir",
            "/tmp/tiles",
        ]);
        assert!((params.lat + 33.86).abs() < 1e-9);
        assert!((params.lon - 151.21).abs() < 1e-9);
        assert!((params.altitude - 300.0).abs() < 1e-9);
        assert_eq!(params.ticks, 5);
        assert!((params.descent - 25.0).abs() < 1e-9);
        assert_eq!(params.cache_dir, Some(PathBuf::from("/tmp/tiles")));
        assert_eq!(params.config, None);
    }
}
