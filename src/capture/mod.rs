//! Capture backend interface
//!
//! A backend enumerates devices and opens sessions; a session creates
//! [`FrameStream`]s and drives repeating capture into them. The pipeline
//! only ever talks to these traits.

pub mod frame;
pub mod stream;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use frame::{
    CaptureMetadata, Frame, ImagePlane, ImagePlaneSource, MappedPlane, MetadataSource,
    PixelFormat, Resolution,
};
pub use stream::{FrameStream, StreamProducer, StreamSettings, StreamState, StreamStats};
pub use synthetic::{SyntheticBackend, SyntheticConfig, SyntheticStats};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;

use crate::error::{CaptureError, ConfigurationError, DeviceError};
use std::sync::Arc;

/// A capture device exposed by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    /// Backend specific locator, e.g. a device node path
    pub path: String,
}

/// A fixed resolution / frame-rate / format configuration of a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMode {
    pub index: usize,
    pub resolution: Resolution,
    pub frame_duration: Duration,
    pub format: PixelFormat,
}

impl SensorMode {
    pub fn fps(&self) -> f64 {
        if self.frame_duration.is_zero() {
            0.0
        } else {
            1.0 / self.frame_duration.as_secs_f64()
        }
    }
}

/// Configuration snapshot submitted for repeating capture
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub sensor_mode: SensorMode,
    pub streams: Vec<u64>,
    pub enable_isp: bool,
    pub enable_post_processing: bool,
}

impl CaptureRequest {
    pub fn new(sensor_mode: SensorMode) -> Self {
        Self {
            sensor_mode,
            streams: Vec::new(),
            enable_isp: true,
            enable_post_processing: true,
        }
    }

    pub fn enable_stream(&mut self, stream: &FrameStream) {
        if !self.streams.contains(&stream.id()) {
            self.streams.push(stream.id());
        }
    }
}

/// Device provider
pub trait CaptureBackend {
    type Session: CaptureSession;

    /// Short name for logs
    fn name(&self) -> &str;

    /// Bring the backend up; must precede every other call
    fn acquire(&mut self) -> Result<(), DeviceError>;

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn list_sensor_modes(&self, device: &DeviceInfo) -> Result<Vec<SensorMode>, DeviceError>;

    fn open_session(&mut self, device: &DeviceInfo) -> Result<Self::Session, DeviceError>;

    /// Tear the backend down; sessions are released first
    fn release(&mut self) -> Result<(), DeviceError>;
}

/// An open capture session on one device
pub trait CaptureSession: Send {
    fn create_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Arc<FrameStream>, ConfigurationError>;

    fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<(), CaptureError>;

    fn stop_repeating(&mut self) -> Result<(), CaptureError>;

    /// Block until no capture is in flight, at most `timeout`
    fn wait_idle(&mut self, timeout: Duration) -> Result<(), CaptureError>;

    fn release(&mut self) -> Result<(), DeviceError>;
}
