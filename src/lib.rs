pub mod capture;
pub mod driver;
pub mod error;
pub mod system;
pub mod value;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{CameraController, FrameObserver, FrameReader, FrameTelemetry, Image};
pub use error::{DriverError, DriverStatus, Error, LifecycleError, Result};
pub use system::System;
pub use value::TimestampedValue;

use crate::capture::frame::PixelFormat;

/// Fewest in-flight buffers a session may request: the driver fills one
/// while the observer still holds the previous one.
pub const MIN_BUFFER_COUNT: u32 = 2;

/// Color processing applied to raw frames before they reach the consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorProcessing {
    /// Deliver the sensor data as-is (mosaic or luma only)
    #[default]
    Off,
    /// Pick the best strategy for the source format
    Auto,
    /// 2x2 cell replication
    Nearest,
    /// 3x3 bilinear interpolation
    Bilinear,
}

/// Per-frame logging verbosity, ordered from quiet to chatty
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FrameLogging {
    Off,
    ErrorsOnly,
    #[default]
    WarningsAndErrors,
    Verbose,
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub simulator: SimulatorConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub buffer_count: u32,
    pub color_processing: ColorProcessing,
    pub frame_logging: FrameLogging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    /// Deliver every n-th frame as incomplete, 0 disables
    pub error_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub poll_interval_ms: u64,
    pub run_for_secs: Option<u64>,
    /// Stop and restart every camera at this period, `None` keeps one session
    pub restart_every_secs: Option<u64>,
    pub snapshot: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            color_processing: ColorProcessing::Off,
            frame_logging: FrameLogging::WarningsAndErrors,
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < MIN_BUFFER_COUNT {
            return Err(Error::Configuration(format!(
                "buffer_count must be at least {MIN_BUFFER_COUNT}, got {}",
                self.buffer_count
            )));
        }
        Ok(())
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            cameras: 1,
            width: 640,
            height: 480,
            fps: 30,
            pixel_format: PixelFormat::BayerRg8,
            error_every: 0,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            // ~60Hz render loop
            poll_interval_ms: 16,
            run_for_secs: None,
            restart_every_secs: None,
            snapshot: None,
        }
    }
}

impl Config {
    /// Layers an optional TOML file under `CAMLATCH__*` environment overrides,
    /// e.g. `CAMLATCH__ACQUISITION__BUFFER_COUNT=4`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CAMLATCH")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.acquisition.validate()?;
        Ok(config)
    }
}
