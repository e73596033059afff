//! Pipeline controller
//!
//! Start: backend → device → sensor mode → session → stream → worker →
//! ready → request → repeat. Run: block on duration, cancel or worker exit.
//! Stop: stop repeat → wait idle → close stream → join worker → release.
//! Shutdown only unwinds what startup completed and never stops early.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::state::{PipelineState, StateCell};
use super::worker::{self, WorkerExit, WorkerHandle, WorkerOptions, WorkerReport};
use crate::capture::{
    CaptureBackend, CaptureRequest, CaptureSession, FrameStream, StreamSettings,
};
use crate::error::{
    CaptureError, ConfigurationError, DeviceError, PipelineError, ShutdownError, SinkError,
    StartupError, StartupStep,
};
use crate::sink::FrameSink;
use crate::{CaptureConfig, PipelineConfig};

/// Builds a fresh sink for every run
pub type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn FrameSink>, SinkError> + Send>;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub worker_core: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            worker_core: None,
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            worker_core: config.worker_core,
        }
    }
}

/// What ended the run phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Cancelled,
    WorkerFinished,
    StartupFailed,
}

/// Terminal result of one pipeline run
#[derive(Debug)]
pub struct PipelineResult {
    /// First fatal error, if any
    pub outcome: Result<(), PipelineError>,
    pub frames_processed: u64,
    pub stop_reason: StopReason,
    /// Teardown steps that failed; reported alongside, never instead of, the outcome
    pub shutdown_errors: Vec<ShutdownError>,
    pub elapsed: Duration,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }
}

impl std::fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Ok(()) => write!(f, "success, {} frames", self.frames_processed)?,
            Err(e) => write!(f, "failed after {} frames: {}", self.frames_processed, e)?,
        }
        if !self.shutdown_errors.is_empty() {
            write!(f, " ({} shutdown errors)", self.shutdown_errors.len())?;
        }
        Ok(())
    }
}

/// External cancellation for a running pipeline
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: flume::Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Full means a cancel is already pending
        let _ = self.tx.try_send(());
    }
}

/// Everything startup managed to allocate, in order
struct Allocated<S> {
    backend: bool,
    session: Option<S>,
    stream: Option<Arc<FrameStream>>,
    worker: Option<WorkerHandle>,
    repeating: bool,
}

impl<S> Default for Allocated<S> {
    fn default() -> Self {
        Self {
            backend: false,
            session: None,
            stream: None,
            worker: None,
            repeating: false,
        }
    }
}

pub struct PipelineController<B: CaptureBackend> {
    backend: B,
    options: PipelineOptions,
    make_sink: SinkFactory,
    state: StateCell,
    cancel_tx: flume::Sender<()>,
    cancel_rx: flume::Receiver<()>,
}

impl<B: CaptureBackend> PipelineController<B> {
    pub fn new(
        backend: B,
        options: PipelineOptions,
        make_sink: impl FnMut() -> Result<Box<dyn FrameSink>, SinkError> + Send + 'static,
    ) -> Self {
        let (cancel_tx, cancel_rx) = flume::bounded(1);
        Self {
            backend,
            options,
            make_sink: Box::new(make_sink),
            state: StateCell::default(),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Shareable view of the controller state
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Run for `duration`, or less if cancelled or the worker stops
    pub fn run(&mut self, config: &CaptureConfig, duration: Duration) -> PipelineResult {
        self.execute(config, Some(duration))
    }

    /// Run until cancelled or the worker stops
    pub fn run_until_stopped(&mut self, config: &CaptureConfig) -> PipelineResult {
        self.execute(config, None)
    }

    #[instrument(skip(self, config), fields(backend = self.backend.name()))]
    fn execute(&mut self, config: &CaptureConfig, duration: Option<Duration>) -> PipelineResult {
        let started = Instant::now();
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let mut allocated = Allocated::default();

        self.state.set(PipelineState::Starting);
        let (outcome, stop_reason) = match self.start(config, &mut allocated, shutdown_tx) {
            Ok(()) => {
                self.state.set(PipelineState::Running);
                (Ok(()), self.wait(duration, &shutdown_rx))
            }
            Err(e) => {
                error!("{}", e);
                self.state.set(PipelineState::Failed);
                (Err(e), StopReason::StartupFailed)
            }
        };
        info!(?stop_reason, "Shutting down");

        self.state.set(PipelineState::Stopping);
        let (report, shutdown_errors) = self.shutdown(allocated);
        let worker_lost = shutdown_errors
            .iter()
            .any(|e| matches!(e, ShutdownError::WorkerPanicked));

        let frames_processed = report.as_ref().map_or(0, |r| r.frames_processed);
        let outcome = match (outcome, report) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(WorkerReport { outcome: Err(e), .. })) => Err(PipelineError::Runtime(e)),
            (Ok(()), None) if worker_lost => Err(PipelineError::WorkerLost),
            (Ok(()), _) => Ok(()),
        };

        // Drop cancels that raced with the end of this run
        while self.cancel_rx.try_recv().is_ok() {}
        self.state.set(PipelineState::Idle);

        let result = PipelineResult {
            outcome,
            frames_processed,
            stop_reason,
            shutdown_errors,
            elapsed: started.elapsed(),
        };
        info!("Pipeline done: {}", result);
        result
    }

    fn start(
        &mut self,
        config: &CaptureConfig,
        allocated: &mut Allocated<B::Session>,
        shutdown_tx: flume::Sender<WorkerExit>,
    ) -> Result<(), PipelineError> {
        use StartupStep::*;

        self.backend
            .acquire()
            .map_err(|e| PipelineError::startup(AcquireBackend, e))?;
        allocated.backend = true;

        let devices = self
            .backend
            .enumerate_devices()
            .map_err(|e| PipelineError::startup(SelectDevice, e))?;
        if devices.is_empty() {
            return Err(PipelineError::startup(SelectDevice, DeviceError::NoDevices));
        }
        let device = devices.get(config.device_index).cloned().ok_or_else(|| {
            PipelineError::startup(
                SelectDevice,
                DeviceError::IndexOutOfRange {
                    index: config.device_index,
                    count: devices.len(),
                },
            )
        })?;
        info!(device = %device.name, path = %device.path, "Using capture device");

        let modes = self
            .backend
            .list_sensor_modes(&device)
            .map_err(|e| PipelineError::startup(SelectSensorMode, e))?;
        if modes.is_empty() {
            return Err(PipelineError::startup(
                SelectSensorMode,
                DeviceError::NoSensorModes {
                    device: device.path.clone(),
                },
            ));
        }
        let mode_index = config.sensor_mode_index.unwrap_or(0);
        let mode = modes.get(mode_index).cloned().ok_or_else(|| {
            PipelineError::startup(
                SelectSensorMode,
                ConfigurationError::SensorModeOutOfRange {
                    index: mode_index,
                    count: modes.len(),
                },
            )
        })?;
        info!(
            mode = mode.index,
            resolution = %mode.resolution,
            fps = mode.fps(),
            "Selected sensor mode"
        );

        let session = self
            .backend
            .open_session(&device)
            .map_err(|e| PipelineError::startup(OpenSession, e))?;
        let session = allocated.session.insert(session);

        info!("Creating the output stream");
        let settings = StreamSettings {
            pixel_format: config.pixel_format,
            resolution: mode.resolution,
            metadata_enabled: config.metadata,
        };
        let stream = session
            .create_stream(&settings)
            .map_err(|e| PipelineError::startup(CreateStream, e))?;
        allocated.stream = Some(Arc::clone(&stream));

        info!("Launching consumer thread");
        let sink = (self.make_sink)()
            .map_err(|e| PipelineError::startup(LaunchWorker, StartupError::Sink(e)))?;
        let options = WorkerOptions {
            connect_timeout: self.options.connect_timeout,
            core: self.options.worker_core,
        };
        let worker = worker::spawn(Arc::clone(&stream), sink, options, shutdown_tx)
            .map_err(|e| PipelineError::startup(LaunchWorker, StartupError::Spawn(e)))?;
        let worker = allocated.worker.insert(worker);

        worker
            .wait_ready()
            .map_err(|e| PipelineError::startup(WaitWorkerReady, e))?;

        let mut request = CaptureRequest::new(mode);
        request.enable_stream(&stream);
        request.enable_isp = config.enable_isp;
        request.enable_post_processing = config.enable_post_processing;

        info!(
            isp = request.enable_isp,
            post_processing = request.enable_post_processing,
            "Starting repeat capture requests"
        );
        session
            .submit_repeating(&request)
            .map_err(|e| PipelineError::startup(SubmitRepeating, e))?;
        allocated.repeating = true;

        Ok(())
    }

    /// Block until the run phase ends. No polling: a single select over the
    /// cancel and worker channels with the duration as deadline.
    fn wait(
        &self,
        duration: Option<Duration>,
        shutdown_rx: &flume::Receiver<WorkerExit>,
    ) -> StopReason {
        info!(?duration, "Pipeline running");

        let selector = flume::Selector::new()
            .recv(&self.cancel_rx, |_| StopReason::Cancelled)
            .recv(shutdown_rx, |exit| {
                debug!(?exit, "Worker requested shutdown");
                StopReason::WorkerFinished
            });

        match duration {
            Some(duration) => selector
                .wait_timeout(duration)
                .unwrap_or(StopReason::DurationElapsed),
            None => selector.wait(),
        }
    }

    fn shutdown(
        &mut self,
        mut allocated: Allocated<B::Session>,
    ) -> (Option<WorkerReport>, Vec<ShutdownError>) {
        let mut errors = Vec::new();

        if let Some(session) = allocated.session.as_mut() {
            if allocated.repeating {
                info!("Stopping repeat capture requests");
                if let Err(e) = session.stop_repeating() {
                    warn!("Stop repeating failed: {}", e);
                    errors.push(ShutdownError::StopRepeating(e.to_string()));
                }

                match session.wait_idle(self.options.idle_timeout) {
                    Ok(()) => debug!("Backend idle"),
                    Err(CaptureError::IdleTimeout(timeout)) => {
                        warn!(?timeout, "Backend did not go idle");
                        errors.push(ShutdownError::IdleTimeout(timeout));
                    }
                    Err(e) => {
                        warn!("Wait for idle failed: {}", e);
                        errors.push(ShutdownError::WaitIdle(e.to_string()));
                    }
                }
            }
        }

        // Unblocks the worker's acquire()
        if let Some(stream) = allocated.stream.take() {
            stream.close();
        }

        let report = allocated.worker.take().and_then(|worker| match worker.join() {
            Ok(report) => Some(report),
            Err(e) => {
                error!("{}", e);
                errors.push(e);
                None
            }
        });

        if let Some(mut session) = allocated.session.take() {
            if let Err(e) = session.release() {
                warn!("Session release failed: {}", e);
                errors.push(ShutdownError::ReleaseSession(e.to_string()));
            }
        }

        if allocated.backend {
            if let Err(e) = self.backend.release() {
                warn!("Backend release failed: {}", e);
                errors.push(ShutdownError::ReleaseBackend(e.to_string()));
            }
        }

        (report, errors)
    }
}
