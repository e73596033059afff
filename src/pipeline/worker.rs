//! Frame consumer worker
//!
//! Runs on its own thread: connect, signal readiness, drain the stream into
//! the sink until the stream is closed or something fails, then ask the
//! controller to shut down. The worker never touches the backend.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::capture::{Frame, FrameStream, ImagePlaneSource, MetadataSource};
use crate::error::{ConnectionError, ShutdownError, StartupError, WorkerError};
use crate::sink::FrameSink;
use crate::utils::hex_preview;

/// Bytes shown per plane in the per-frame trace
const PREVIEW_BYTES: usize = 12;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub connect_timeout: Duration,
    /// Pin the worker thread to this CPU core
    pub core: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            core: None,
        }
    }
}

/// Why the worker asked for shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stream closed, every acquired frame persisted
    Finished { frames_processed: u64 },
    /// A fatal error stopped the loop
    Failed { frames_processed: u64 },
    /// The thread unwound without reporting
    Aborted,
}

/// Final account of a worker run, returned on join
#[derive(Debug)]
pub struct WorkerReport {
    pub frames_processed: u64,
    pub last_frame: Option<u64>,
    pub outcome: Result<(), WorkerError>,
}

/// Sends exactly one shutdown request, `Aborted` if dropped unsent
struct ShutdownSignal {
    tx: Option<flume::Sender<WorkerExit>>,
}

impl ShutdownSignal {
    fn send(&mut self, exit: WorkerExit) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(exit);
        }
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        self.send(WorkerExit::Aborted);
    }
}

/// Controller-side handle on a running worker
pub struct WorkerHandle {
    ready_rx: flume::Receiver<Result<(), ConnectionError>>,
    handle: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    /// Block until the worker is past `connect()`
    pub fn wait_ready(&self) -> Result<(), StartupError> {
        match self.ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StartupError::Worker(WorkerError::Connection(e))),
            Err(_) => Err(StartupError::WorkerVanished),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<WorkerReport, ShutdownError> {
        self.handle.join().map_err(|_| ShutdownError::WorkerPanicked)
    }
}

/// Launch the consumer thread.
///
/// `shutdown_tx` receives one [`WorkerExit`] when the loop ends, however it
/// ends.
pub fn spawn(
    stream: Arc<FrameStream>,
    sink: Box<dyn FrameSink>,
    options: WorkerOptions,
    shutdown_tx: flume::Sender<WorkerExit>,
) -> io::Result<WorkerHandle> {
    let (ready_tx, ready_rx) = flume::bounded(1);

    let handle = thread::Builder::new()
        .name(format!("frame-consumer-{}", stream.id()))
        .spawn(move || {
            let consumer = FrameConsumer {
                stream,
                sink,
                frames_processed: 0,
                last_frame: None,
            };
            consumer.run(&options, ready_tx, ShutdownSignal { tx: Some(shutdown_tx) })
        })?;

    Ok(WorkerHandle { ready_rx, handle })
}

fn pin_to_core(core: usize) {
    let Some(id) = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|c| c.id == core))
    else {
        warn!(core, "CPU core not available, worker left unpinned");
        return;
    };
    if core_affinity::set_for_current(id) {
        debug!(core, "Worker pinned");
    } else {
        warn!(core, "Failed to pin worker");
    }
}

struct FrameConsumer {
    stream: Arc<FrameStream>,
    sink: Box<dyn FrameSink>,
    frames_processed: u64,
    last_frame: Option<u64>,
}

impl FrameConsumer {
    fn run(
        mut self,
        options: &WorkerOptions,
        ready_tx: flume::Sender<Result<(), ConnectionError>>,
        mut shutdown: ShutdownSignal,
    ) -> WorkerReport {
        if let Some(core) = options.core {
            pin_to_core(core);
        }

        info!(stream = self.stream.id(), "Waiting until producer is connected...");
        if let Err(e) = self.stream.connect(options.connect_timeout) {
            error!("Stream failed to connect: {}", e);
            let _ = ready_tx.send(Err(e.clone()));
            shutdown.send(WorkerExit::Failed { frames_processed: 0 });
            return self.report(Err(WorkerError::Connection(e)));
        }
        info!("Producer has connected; continuing");
        let _ = ready_tx.send(Ok(()));

        let mut outcome = self.drain();
        if let Err(e) = &outcome {
            error!("Consumer stopped: {}", e);
        }

        if let Err(e) = self.sink.finish() {
            error!("Sink finish failed: {}", e);
            if outcome.is_ok() {
                outcome = Err(WorkerError::SinkFinish(e));
            }
        }

        info!(frames = self.frames_processed, "Consumer done");
        let frames_processed = self.frames_processed;
        shutdown.send(match outcome {
            Ok(()) => WorkerExit::Finished { frames_processed },
            Err(_) => WorkerExit::Failed { frames_processed },
        });
        self.report(outcome)
    }

    fn report(&self, outcome: Result<(), WorkerError>) -> WorkerReport {
        WorkerReport {
            frames_processed: self.frames_processed,
            last_frame: self.last_frame,
            outcome,
        }
    }

    /// Acquire until the stream closes. Fail-fast: no frame after a failed one.
    fn drain(&mut self) -> Result<(), WorkerError> {
        while let Some(frame) = self.stream.acquire() {
            self.process(&frame)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: &Frame) -> Result<(), WorkerError> {
        debug!(
            frame = frame.number,
            timestamp_ns = frame.timestamp_ns,
            "Acquired frame"
        );

        if let Some(meta) = frame.capture_metadata() {
            debug!(
                sensor_timestamp_ns = meta.sensor_timestamp_ns,
                lux = ?meta.scene_lux,
                "Capture metadata"
            );
        }

        let planes = frame.map_planes().map_err(|source| WorkerError::FrameMap {
            frame: frame.number,
            source,
        })?;

        for plane in &planes {
            trace!(
                "buffer {} ({}x{}, {} stride), {}",
                plane.index,
                plane.width,
                plane.height,
                plane.stride,
                hex_preview(plane.bytes, PREVIEW_BYTES)
            );
        }

        let started = Instant::now();
        self.sink
            .write(frame, &planes)
            .map_err(|source| WorkerError::SinkWrite {
                frame: frame.number,
                source,
            })?;

        metrics::histogram!("rawcap_sink_write_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("rawcap_frames_written_total").increment(1);

        self.frames_processed += 1;
        self.last_frame = Some(frame.number);
        Ok(())
    }
}
