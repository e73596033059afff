use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rawcap::capture::{
    Frame, FrameStream, MappedPlane, PixelFormat, Resolution, StreamSettings, SyntheticBackend,
    SyntheticConfig, SyntheticStats,
};
use rawcap::error::{
    ConnectionError, DeviceError, FrameMapError, PipelineError, ShutdownError, SinkError,
    StartupError, StartupStep, WorkerError,
};
use rawcap::pipeline::{PipelineController, PipelineOptions, StopReason};
use rawcap::sink::{FrameSink, RawFileSink};
use rawcap::{CaptureConfig, OutputConfig};

#[derive(Debug, Default)]
struct Recorded {
    attempted: Vec<u64>,
    written: Vec<u64>,
    finished: bool,
}

/// Sink that remembers frame numbers, optionally failing on one of them
#[derive(Clone, Default)]
struct Recorder {
    inner: Arc<Mutex<Recorded>>,
    fail_on: Option<u64>,
}

impl Recorder {
    fn failing_on(number: u64) -> Self {
        Self {
            fail_on: Some(number),
            ..Default::default()
        }
    }

    fn written(&self) -> Vec<u64> {
        self.inner.lock().unwrap().written.clone()
    }

    fn attempted(&self) -> Vec<u64> {
        self.inner.lock().unwrap().attempted.clone()
    }

    fn finished(&self) -> bool {
        self.inner.lock().unwrap().finished
    }
}

impl FrameSink for Recorder {
    fn write(&mut self, frame: &Frame, _planes: &[MappedPlane<'_>]) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempted.push(frame.number);
        if self.fail_on == Some(frame.number) {
            return Err(SinkError::Rejected("disk full".into()));
        }
        inner.written.push(frame.number);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.inner.lock().unwrap().finished = true;
        Ok(())
    }
}

fn synthetic(interval_ms: u64) -> SyntheticConfig {
    SyntheticConfig {
        sensor_modes: vec![Resolution::new(32, 16)],
        frame_interval_ms: interval_ms,
        ..Default::default()
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        connect_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_millis(300),
        worker_core: None,
    }
}

fn pipeline(
    config: SyntheticConfig,
    recorder: &Recorder,
) -> (PipelineController<SyntheticBackend>, Arc<SyntheticStats>) {
    let backend = SyntheticBackend::new(config);
    let stats = backend.stats();
    let recorder = recorder.clone();
    let controller = PipelineController::new(backend, options(), move || {
        Ok(Box::new(recorder.clone()) as Box<dyn FrameSink>)
    });
    (controller, stats)
}

fn assert_released_once(stats: &SyntheticStats) {
    assert_eq!(stats.backend_acquired(), 1);
    assert_eq!(stats.backend_released(), 1);
    assert_eq!(stats.sessions_opened(), 1);
    assert_eq!(stats.sessions_released(), 1);
}

#[test]
fn zero_duration_unwinds_everything_once() {
    let recorder = Recorder::default();
    let (mut controller, stats) = pipeline(synthetic(10), &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::ZERO);

    assert!(result.is_success(), "{result}");
    assert_eq!(result.stop_reason, StopReason::DurationElapsed);
    assert!(result.shutdown_errors.is_empty(), "{:?}", result.shutdown_errors);
    assert_released_once(&stats);
    assert_eq!(stats.streams_created(), 1);
    assert_eq!(stats.repeats_submitted(), 1);
    assert_eq!(stats.repeats_stopped(), 1);
    assert!(recorder.finished());
}

#[test]
fn frame_numbers_reach_the_sink_strictly_increasing() {
    let recorder = Recorder::default();
    let (mut controller, _stats) = pipeline(synthetic(5), &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_millis(300));
    assert!(result.is_success(), "{result}");

    let written = recorder.written();
    assert!(!written.is_empty());
    assert_eq!(written[0], 1);
    assert!(written.windows(2).all(|w| w[0] < w[1]), "{written:?}");
    assert_eq!(result.frames_processed, written.len() as u64);
}

#[test]
fn three_frames_in_one_second_are_written_in_order() {
    let recorder = Recorder::default();
    let config = SyntheticConfig {
        frame_limit: Some(3),
        ..synthetic(300)
    };
    let (mut controller, stats) = pipeline(config, &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_secs(1));

    assert!(result.is_success(), "{result}");
    assert_eq!(result.stop_reason, StopReason::DurationElapsed);
    assert_eq!(result.frames_processed, 3);
    assert_eq!(recorder.written(), vec![1, 2, 3]);
    assert_eq!(stats.frames_produced(), 3);
}

#[test]
fn every_presented_frame_reaches_the_sink() {
    for _ in 0..100 {
        let recorder = Recorder::default();
        let config = SyntheticConfig {
            frame_limit: Some(1),
            ..synthetic(0)
        };
        let (mut controller, stats) = pipeline(config, &recorder);

        let result = controller.run(&CaptureConfig::default(), Duration::ZERO);

        assert!(result.is_success(), "{result}");
        assert_eq!(result.frames_processed, stats.frames_produced());
        assert_eq!(recorder.written().len() as u64, stats.frames_produced());
    }
}

#[test]
fn producer_that_never_attaches_fails_worker_readiness() {
    let recorder = Recorder::default();
    let config = SyntheticConfig {
        detached_stream: true,
        ..synthetic(10)
    };
    let (mut controller, stats) = pipeline(config, &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_secs(5));

    assert!(
        matches!(
            result.error(),
            Some(PipelineError::Startup {
                step: StartupStep::WaitWorkerReady,
                source: StartupError::Worker(WorkerError::Connection(ConnectionError::Timeout(_))),
            })
        ),
        "{result}"
    );
    assert_eq!(result.stop_reason, StopReason::StartupFailed);
    assert_eq!(result.frames_processed, 0);
    assert_eq!(stats.streams_created(), 1);
    assert_eq!(stats.repeats_submitted(), 0);
    assert_eq!(stats.repeats_stopped(), 0);
    assert_released_once(&stats);
    assert!(recorder.written().is_empty());
}

#[test]
fn sink_failure_stops_before_the_next_frame() {
    let recorder = Recorder::failing_on(3);
    let (mut controller, stats) = pipeline(synthetic(10), &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_secs(5));

    assert_eq!(result.stop_reason, StopReason::WorkerFinished);
    assert!(
        matches!(
            result.error(),
            Some(PipelineError::Runtime(WorkerError::SinkWrite { frame: 3, .. }))
        ),
        "{result}"
    );
    assert_eq!(recorder.attempted(), vec![1, 2, 3]);
    assert_eq!(recorder.written(), vec![1, 2]);
    assert_eq!(result.frames_processed, 2);
    assert_released_once(&stats);
}

#[test]
fn unmappable_frame_is_a_runtime_error() {
    let recorder = Recorder::default();
    let config = SyntheticConfig {
        unmappable_frame: Some(2),
        ..synthetic(10)
    };
    let (mut controller, _stats) = pipeline(config, &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_secs(5));

    assert!(
        matches!(
            result.error(),
            Some(PipelineError::Runtime(WorkerError::FrameMap {
                frame: 2,
                source: FrameMapError::Unavailable { plane: 0 },
            }))
        ),
        "{result}"
    );
    assert_eq!(recorder.written(), vec![1]);
}

#[test]
fn zero_devices_fail_before_any_stream_or_worker() {
    let recorder = Recorder::default();
    let config = SyntheticConfig {
        device_count: 0,
        ..synthetic(10)
    };
    let (mut controller, stats) = pipeline(config, &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_secs(1));

    let err = result.error().expect("startup must fail");
    assert!(err.is_device_error());
    assert!(matches!(
        err,
        PipelineError::Startup {
            step: StartupStep::SelectDevice,
            source: StartupError::Device(DeviceError::NoDevices),
        }
    ));
    assert_eq!(result.stop_reason, StopReason::StartupFailed);
    assert_eq!(stats.sessions_opened(), 0);
    assert_eq!(stats.streams_created(), 0);
    // No worker ever ran, so the sink was never opened
    assert!(!recorder.finished());
    assert_eq!(stats.backend_released(), 1);
}

#[test]
fn idle_timeout_keeps_outcome_and_still_unwinds() {
    let recorder = Recorder::default();
    let config = SyntheticConfig {
        stall_idle: true,
        ..synthetic(10)
    };
    let (mut controller, stats) = pipeline(config, &recorder);

    let result = controller.run(&CaptureConfig::default(), Duration::from_millis(100));

    assert!(result.is_success(), "{result}");
    assert!(result
        .shutdown_errors
        .iter()
        .any(|e| matches!(e, ShutdownError::IdleTimeout(_))));
    // The worker saw the stream close and was joined
    assert!(recorder.finished());
    assert_released_once(&stats);
}

#[test]
fn cancel_ends_an_unbounded_run() {
    let recorder = Recorder::default();
    let (mut controller, _stats) = pipeline(synthetic(10), &recorder);
    let cancel = controller.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
    });
    let result = controller.run_until_stopped(&CaptureConfig::default());
    canceller.join().unwrap();

    assert!(result.is_success(), "{result}");
    assert_eq!(result.stop_reason, StopReason::Cancelled);
}

#[test]
fn closing_unblocks_a_waiting_acquire() {
    let settings = StreamSettings {
        pixel_format: PixelFormat::Raw16,
        resolution: Resolution::new(4, 2),
        metadata_enabled: false,
    };
    let stream = FrameStream::new(7, settings);
    let _producer = stream.attach_producer().unwrap();
    stream.connect(Duration::from_millis(100)).unwrap();

    let (done_tx, done_rx) = flume::bounded(1);
    let consumer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            let frame = stream.acquire();
            let _ = done_tx.send(frame.is_none());
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(done_rx.is_empty(), "acquire returned before close");

    let closed_at = Instant::now();
    stream.close();
    let got_none = done_rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert!(got_none);
    assert!(closed_at.elapsed() < Duration::from_millis(500));
    consumer.join().unwrap();
}

#[test]
fn raw_files_hold_visible_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputConfig {
        directory: dir.path().to_path_buf(),
        file_prefix: "cap".into(),
        overwrite: false,
    };
    let backend = SyntheticBackend::new(SyntheticConfig {
        sensor_modes: vec![Resolution::new(16, 8)],
        frame_interval_ms: 10,
        frame_limit: Some(2),
        ..Default::default()
    });
    let mut controller = PipelineController::new(backend, options(), move || {
        Ok(Box::new(RawFileSink::new(&output)?) as Box<dyn FrameSink>)
    });

    let result = controller.run(&CaptureConfig::default(), Duration::from_millis(200));
    assert!(result.is_success(), "{result}");
    assert_eq!(result.frames_processed, 2);

    for number in 1..=2 {
        let path = dir.path().join(format!("cap_{number:08}.raw"));
        let bytes = std::fs::read(&path).unwrap();
        // 16 x 8 Raw16, stride padding dropped
        assert_eq!(bytes.len(), 16 * 8 * 2);
        let first = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, 0x0c00 + number as u16 * 16);
    }
    assert!(!dir.path().join("cap_00000003.raw").exists());
}
