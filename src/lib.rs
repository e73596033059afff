pub mod capture;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use capture::synthetic::SyntheticConfig;
use serde::{Deserialize, Serialize};

/// Prefix of environment overrides, e.g. `RAWCAP__PIPELINE__DURATION_SECS=10`
pub const ENV_PREFIX: &str = "RAWCAP";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub backend: BackendConfig,
}

/// What to capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device_index: usize,
    /// `None` picks the first mode the device reports
    pub sensor_mode_index: Option<usize>,
    pub enable_isp: bool,
    pub enable_post_processing: bool,
    pub pixel_format: PixelFormat,
    pub metadata: bool,
}

/// Timing of the run and of the shutdown handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `None` runs until interrupted
    pub duration_secs: Option<u64>,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// CPU core for the consumer thread
    pub worker_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    /// Keep only the latest frame in `<prefix>.raw`
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub synthetic: SyntheticConfig,
    /// Buffers requested from the driver (V4L2)
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            sensor_mode_index: None,
            enable_isp: true,
            enable_post_processing: false,
            pixel_format: PixelFormat::Raw16,
            metadata: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duration_secs: Some(5),
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            worker_core: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_prefix: "rawcap".into(),
            overwrite: false,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Synthetic,
            synthetic: SyntheticConfig::default(),
            buffer_count: 4,
        }
    }
}

impl PipelineConfig {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `RAWCAP__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        // Missing keys fall back to the serde defaults
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
