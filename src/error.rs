//! Error taxonomy for the capture pipeline

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Device enumeration and session failures
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no capture devices available")]
    NoDevices,

    #[error("device index {index} out of range ({count} devices)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("device {device} exposes no sensor modes")]
    NoSensorModes { device: String },

    #[error("failed to open session on {device}: {reason}")]
    Session { device: String, reason: String },

    #[error("backend failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Invalid sensor mode / format / resolution
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("sensor mode index {index} out of range ({count} modes)")]
    SensorModeOutOfRange { index: usize, count: usize },

    #[error("pixel format {0:?} not supported by this backend")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid resolution {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    #[error("stream setup failed: {0}")]
    Stream(String),
}

/// The stream never reached the connected state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("stream did not connect within {0:?}")]
    Timeout(Duration),

    #[error("stream closed before a producer attached")]
    Closed,
}

/// A frame plane could not be mapped to readable bytes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameMapError {
    #[error("plane {plane} does not exist (frame has {count})")]
    NoSuchPlane { plane: usize, count: usize },

    #[error("plane {plane} has no exported buffer")]
    Unavailable { plane: usize },

    #[error("plane {plane} buffer holds {actual} bytes, geometry needs {expected}")]
    Truncated {
        plane: usize,
        expected: usize,
        actual: usize,
    },
}

/// Persistence failure reported by a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("sink rejected frame: {0}")]
    Rejected(String),
}

/// Producer-side stream failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,

    #[error("stream already has a producer attached")]
    AlreadyAttached,

    #[error("hand-off cancelled by the producer")]
    Cancelled,

    #[error("frame number {number} does not follow {last}")]
    NonMonotonic { number: u64, last: u64 },
}

/// Failures submitting or running a capture request
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("repeating capture already active")]
    AlreadyRepeating,

    #[error("request references unknown stream {0}")]
    UnknownStream(u64),

    #[error("failed to submit repeating request: {0}")]
    Submit(String),

    #[error("captures still in flight after {0:?}")]
    IdleTimeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A teardown step failed. Collected and reported, never fatal to the unwind.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to stop repeating capture: {0}")]
    StopRepeating(String),

    #[error("backend still busy after {0:?}")]
    IdleTimeout(Duration),

    #[error("failed waiting for backend idle: {0}")]
    WaitIdle(String),

    #[error("consumer worker panicked")]
    WorkerPanicked,

    #[error("failed to release session: {0}")]
    ReleaseSession(String),

    #[error("failed to release backend: {0}")]
    ReleaseBackend(String),
}

/// Fatal consumer-worker errors, surfaced as the pipeline's runtime result
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("frame {frame}: {source}")]
    FrameMap {
        frame: u64,
        #[source]
        source: FrameMapError,
    },

    #[error("frame {frame}: sink write failed: {source}")]
    SinkWrite {
        frame: u64,
        #[source]
        source: SinkError,
    },

    #[error("sink failed to finish: {0}")]
    SinkFinish(#[source] SinkError),
}

/// Startup step that was executing when the pipeline failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    AcquireBackend,
    SelectDevice,
    SelectSensorMode,
    OpenSession,
    CreateStream,
    LaunchWorker,
    WaitWorkerReady,
    SubmitRepeating,
}

impl std::fmt::Display for StartupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StartupStep::AcquireBackend => "acquire backend",
            StartupStep::SelectDevice => "select device",
            StartupStep::SelectSensorMode => "select sensor mode",
            StartupStep::OpenSession => "open session",
            StartupStep::CreateStream => "create stream",
            StartupStep::LaunchWorker => "launch worker",
            StartupStep::WaitWorkerReady => "wait for worker",
            StartupStep::SubmitRepeating => "submit repeating request",
        };
        f.write_str(name)
    }
}

/// Underlying cause of a startup failure
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("failed to open frame sink: {0}")]
    Sink(#[source] SinkError),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("consumer worker exited before signalling readiness")]
    WorkerVanished,
}

/// Terminal pipeline failure
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline startup failed at '{step}': {source}")]
    Startup {
        step: StartupStep,
        #[source]
        source: StartupError,
    },

    #[error("pipeline runtime error: {0}")]
    Runtime(#[source] WorkerError),

    #[error("consumer worker terminated abnormally")]
    WorkerLost,
}

impl PipelineError {
    pub fn startup(step: StartupStep, source: impl Into<StartupError>) -> Self {
        PipelineError::Startup {
            step,
            source: source.into(),
        }
    }

    /// True when the failure is a device enumeration/session problem
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Startup {
                source: StartupError::Device(_),
                ..
            }
        )
    }
}
