//! Synthetic capture backend
//!
//! Produces RGGB test-pattern frames on a producer thread per repeating
//! request. Deterministic, device-free, and able to inject the failures the
//! pipeline has to survive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    CaptureBackend, CaptureMetadata, CaptureRequest, CaptureSession, DeviceInfo, Frame,
    FrameStream, ImagePlane, PixelFormat, Resolution, SensorMode, StreamProducer, StreamSettings,
};
use crate::error::{CaptureError, ConfigurationError, DeviceError, StreamError};

/// Row alignment of generated planes, so stride differs from width
const ROW_ALIGN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub device_count: usize,
    pub sensor_modes: Vec<Resolution>,
    pub frame_interval_ms: u64,
    /// Stop producing after this many frames
    pub frame_limit: Option<u64>,
    /// Deliver this frame number without a readable plane buffer
    pub unmappable_frame: Option<u64>,
    /// `wait_idle` never reports idle
    pub stall_idle: bool,
    /// `submit_repeating` is rejected
    pub fail_submit: bool,
    /// Streams are created without a producer, so `connect()` never succeeds
    pub detached_stream: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            sensor_modes: vec![Resolution::new(1920, 1080), Resolution::new(1280, 720)],
            frame_interval_ms: 33,
            frame_limit: None,
            unmappable_frame: None,
            stall_idle: false,
            fail_submit: false,
            detached_stream: false,
        }
    }
}

impl SyntheticConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Lifecycle call counters, shared with whoever holds a clone of the `Arc`
#[derive(Debug, Default)]
pub struct SyntheticStats {
    backend_acquired: AtomicU64,
    backend_released: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_released: AtomicU64,
    streams_created: AtomicU64,
    repeats_submitted: AtomicU64,
    repeats_stopped: AtomicU64,
    frames_produced: AtomicU64,
}

macro_rules! counter_getters {
    ($($name:ident),* $(,)?) => {
        impl SyntheticStats {
            $(
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::SeqCst)
                }
            )*
        }
    };
}

counter_getters!(
    backend_acquired,
    backend_released,
    sessions_opened,
    sessions_released,
    streams_created,
    repeats_submitted,
    repeats_stopped,
    frames_produced,
);

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

pub struct SyntheticBackend {
    config: SyntheticConfig,
    stats: Arc<SyntheticStats>,
    acquired: bool,
    next_stream_id: Arc<AtomicU64>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            stats: Arc::new(SyntheticStats::default()),
            acquired: false,
            next_stream_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }

    fn ensure_acquired(&self) -> Result<(), DeviceError> {
        if self.acquired {
            Ok(())
        } else {
            Err(DeviceError::Backend("synthetic backend not acquired".into()))
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    type Session = SyntheticSession;

    fn name(&self) -> &str {
        "synthetic"
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        if !self.acquired {
            self.acquired = true;
            bump(&self.stats.backend_acquired);
            info!(devices = self.config.device_count, "Synthetic backend up");
        }
        Ok(())
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.ensure_acquired()?;
        Ok((0..self.config.device_count)
            .map(|index| DeviceInfo {
                index,
                name: format!("synthetic sensor {index}"),
                path: format!("synthetic://{index}"),
            })
            .collect())
    }

    fn list_sensor_modes(&self, _device: &DeviceInfo) -> Result<Vec<SensorMode>, DeviceError> {
        self.ensure_acquired()?;
        Ok(self
            .config
            .sensor_modes
            .iter()
            .enumerate()
            .map(|(index, &resolution)| SensorMode {
                index,
                resolution,
                frame_duration: self.config.frame_interval(),
                format: PixelFormat::Raw16,
            })
            .collect())
    }

    fn open_session(&mut self, device: &DeviceInfo) -> Result<SyntheticSession, DeviceError> {
        self.ensure_acquired()?;
        if device.index >= self.config.device_count {
            return Err(DeviceError::Session {
                device: device.path.clone(),
                reason: "no such device".into(),
            });
        }

        bump(&self.stats.sessions_opened);
        debug!(device = %device.path, "Synthetic session opened");

        Ok(SyntheticSession {
            device: device.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            next_stream_id: Arc::clone(&self.next_stream_id),
            streams: Vec::new(),
            repeater: None,
            released: false,
        })
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        if self.acquired {
            self.acquired = false;
            bump(&self.stats.backend_released);
            info!("Synthetic backend released");
        }
        Ok(())
    }
}

struct StreamSlot {
    stream: Arc<FrameStream>,
    producer: Option<StreamProducer>,
}

/// Producer thread driving one repeating request
struct Repeater {
    stop_tx: Option<Sender<()>>,
    /// Disconnects when the producer thread is done presenting
    idle_rx: Receiver<()>,
    handle: JoinHandle<Vec<(u64, StreamProducer)>>,
}

pub struct SyntheticSession {
    device: DeviceInfo,
    config: SyntheticConfig,
    stats: Arc<SyntheticStats>,
    next_stream_id: Arc<AtomicU64>,
    streams: Vec<StreamSlot>,
    repeater: Option<Repeater>,
    released: bool,
}

impl SyntheticSession {
    /// Join a finished producer thread and take its producers back
    fn reclaim(&mut self) {
        let Some(repeater) = self.repeater.take() else {
            return;
        };
        drop(repeater.stop_tx);

        match repeater.handle.join() {
            Ok(producers) => {
                for (id, producer) in producers {
                    if let Some(slot) = self.streams.iter_mut().find(|s| s.stream.id() == id) {
                        slot.producer = Some(producer);
                    }
                }
            }
            Err(_) => warn!(device = %self.device.path, "Synthetic producer thread panicked"),
        }
    }
}

impl CaptureSession for SyntheticSession {
    fn create_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Arc<FrameStream>, ConfigurationError> {
        if settings.resolution.is_empty() {
            return Err(ConfigurationError::InvalidResolution {
                width: settings.resolution.width,
                height: settings.resolution.height,
            });
        }
        if !settings.pixel_format.is_bayer() {
            return Err(ConfigurationError::UnsupportedFormat(settings.pixel_format));
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = FrameStream::new(id, *settings);
        let producer = if self.config.detached_stream {
            warn!(stream = id, "Synthetic stream left without a producer");
            None
        } else {
            let producer = stream
                .attach_producer()
                .map_err(|e| ConfigurationError::Stream(e.to_string()))?;
            Some(producer)
        };

        bump(&self.stats.streams_created);
        debug!(stream = id, resolution = %settings.resolution, "Synthetic stream created");

        self.streams.push(StreamSlot {
            stream: Arc::clone(&stream),
            producer,
        });
        Ok(stream)
    }

    fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        if self.repeater.is_some() {
            return Err(CaptureError::AlreadyRepeating);
        }
        if self.config.fail_submit {
            return Err(CaptureError::Submit("injected failure".into()));
        }
        if request.streams.is_empty() {
            return Err(CaptureError::Submit("request enables no streams".into()));
        }

        let mut producers = Vec::with_capacity(request.streams.len());
        for &id in &request.streams {
            let slot = self
                .streams
                .iter_mut()
                .find(|s| s.stream.id() == id)
                .ok_or(CaptureError::UnknownStream(id))?;
            let producer = slot
                .producer
                .take()
                .ok_or_else(|| CaptureError::Submit(format!("stream {id} has no producer")))?;
            producers.push((id, producer));
        }

        debug!(
            isp = request.enable_isp,
            post_processing = request.enable_post_processing,
            mode = request.sensor_mode.index,
            "Synthetic request submitted"
        );

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let (idle_tx, idle_rx) = channel::bounded::<()>(0);
        let generator = PatternGenerator {
            resolution: request.sensor_mode.resolution,
            interval: self.config.frame_interval(),
            limit: self.config.frame_limit,
            unmappable: self.config.unmappable_frame,
            stats: Arc::clone(&self.stats),
        };

        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", self.device.index))
            .spawn(move || {
                let mut producers = producers;
                generator.run(&mut producers, &stop_rx);
                drop(idle_tx);
                producers
            })?;

        bump(&self.stats.repeats_submitted);
        self.repeater = Some(Repeater {
            stop_tx: Some(stop_tx),
            idle_rx,
            handle,
        });
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), CaptureError> {
        if let Some(repeater) = self.repeater.as_mut() {
            if repeater.stop_tx.take().is_some() {
                bump(&self.stats.repeats_stopped);
                debug!(device = %self.device.path, "Synthetic repeat stopped");
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self, timeout: Duration) -> Result<(), CaptureError> {
        if self.config.stall_idle {
            thread::sleep(timeout);
            return Err(CaptureError::IdleTimeout(timeout));
        }

        let Some(repeater) = self.repeater.as_ref() else {
            return Ok(());
        };
        match repeater.idle_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::IdleTimeout(timeout)),
            _ => {
                self.reclaim();
                Ok(())
            }
        }
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // The producer thread exits on stop or once its streams are closed
        self.reclaim();
        self.streams.clear();

        bump(&self.stats.sessions_released);
        debug!(device = %self.device.path, "Synthetic session released");
        Ok(())
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

struct PatternGenerator {
    resolution: Resolution,
    interval: Duration,
    limit: Option<u64>,
    unmappable: Option<u64>,
    stats: Arc<SyntheticStats>,
}

impl PatternGenerator {
    fn run(&self, producers: &mut [(u64, StreamProducer)], stop_rx: &Receiver<()>) {
        let epoch = Instant::now();
        let mut number = 0u64;

        loop {
            if self.limit.is_some_and(|limit| number >= limit) {
                debug!(frames = number, "Synthetic frame limit reached");
                return;
            }
            number += 1;

            let timestamp_ns = epoch.elapsed().as_nanos() as u64;
            for (_, producer) in producers.iter_mut() {
                let settings = *producer.stream().settings();
                let frame = self.frame(number, timestamp_ns, &settings);
                match producer.present_until(frame, stop_rx) {
                    Ok(()) => {}
                    Err(StreamError::Closed | StreamError::Cancelled) => return,
                    Err(e) => {
                        warn!("Synthetic producer failed: {}", e);
                        return;
                    }
                }
            }
            bump(&self.stats.frames_produced);

            select! {
                recv(stop_rx) -> _ => return,
                default(self.interval) => {}
            }
        }
    }

    fn frame(&self, number: u64, timestamp_ns: u64, settings: &StreamSettings) -> Frame {
        let Resolution { width, height } = self.resolution;
        let format = settings.pixel_format;
        let bps = format.bytes_per_sample(0).unwrap_or(2);
        let stride = (width as usize * bps).next_multiple_of(ROW_ALIGN);

        let data = if self.unmappable == Some(number) {
            None
        } else {
            Some(rggb_pattern(width, height, stride, bps, number))
        };

        let metadata = settings.metadata_enabled.then(|| CaptureMetadata {
            sensor_timestamp_ns: timestamp_ns,
            scene_lux: Some(100.0 + (number % 10) as f32 * 12.5),
            exposure_time: Some(self.interval / 2),
            analog_gain: Some(1.0),
        });

        Frame {
            number,
            timestamp_ns,
            format,
            planes: vec![ImagePlane {
                width,
                height,
                stride: stride as u32,
                data,
            }],
            metadata,
        }
    }
}

/// RGGB mosaic whose channel levels drift with the frame number
fn rggb_pattern(width: u32, height: u32, stride: usize, bps: usize, number: u64) -> Bytes {
    let mut buf = vec![0u8; stride * height as usize];
    let shift = (number % 64) as u16 * 16;

    for y in 0..height as usize {
        let row = &mut buf[y * stride..y * stride + width as usize * bps];
        for (x, px) in row.chunks_exact_mut(bps).enumerate() {
            let base = match (y % 2, x % 2) {
                (0, 0) => 0x0c00u16, // R
                (1, 1) => 0x0400,    // B
                _ => 0x0800,         // G
            };
            let level = base.wrapping_add(shift) & 0x0fff;
            if bps == 2 {
                px.copy_from_slice(&level.to_le_bytes());
            } else {
                px[0] = (level >> 4) as u8;
            }
        }
    }
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ImagePlaneSource;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            sensor_modes: vec![Resolution::new(8, 4)],
            frame_interval_ms: 5,
            ..Default::default()
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            pixel_format: PixelFormat::Raw16,
            resolution: Resolution::new(8, 4),
            metadata_enabled: true,
        }
    }

    #[test]
    fn pattern_levels_follow_bayer_layout() {
        let level = |buf: &[u8], at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);

        // 2x2 Raw16, stride 8
        let buf = rggb_pattern(2, 2, 8, 2, 1);
        assert_eq!(level(&buf, 0), 0x0c10);
        assert_eq!(level(&buf, 2), 0x0810);
        assert_eq!(level(&buf, 8), 0x0810);
        assert_eq!(level(&buf, 10), 0x0410);
        // padding stays zero
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);

        // Levels wrap into 12 bits
        let buf = rggb_pattern(1, 1, 2, 2, 63);
        assert_eq!(level(&buf, 0), (0x0c00 + 63 * 16) & 0x0fff);

        // Raw8 keeps the top 8 of 12 bits
        let buf = rggb_pattern(2, 1, 2, 1, 1);
        assert_eq!(&buf[..2], &[0xc1, 0x81]);
    }

    #[test]
    fn requires_acquire() {
        let backend = SyntheticBackend::new(small());
        assert!(backend.enumerate_devices().is_err());
    }

    #[test]
    fn lists_devices_and_modes() {
        let mut backend = SyntheticBackend::new(SyntheticConfig {
            device_count: 2,
            ..small()
        });
        backend.acquire().unwrap();

        let devices = backend.enumerate_devices().unwrap();
        assert_eq!(devices.len(), 2);

        let modes = backend.list_sensor_modes(&devices[0]).unwrap();
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].resolution, Resolution::new(8, 4));
    }

    #[test]
    fn rejects_non_bayer_stream() {
        let mut backend = SyntheticBackend::new(small());
        backend.acquire().unwrap();
        let device = backend.enumerate_devices().unwrap().remove(0);
        let mut session = backend.open_session(&device).unwrap();

        let err = session
            .create_stream(&StreamSettings {
                pixel_format: PixelFormat::Mjpeg,
                ..settings()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedFormat(PixelFormat::Mjpeg)));
    }

    #[test]
    fn repeating_request_delivers_frames() {
        let mut backend = SyntheticBackend::new(SyntheticConfig {
            frame_limit: Some(2),
            ..small()
        });
        backend.acquire().unwrap();
        let device = backend.enumerate_devices().unwrap().remove(0);
        let modes = backend.list_sensor_modes(&device).unwrap();
        let mut session = backend.open_session(&device).unwrap();

        let stream = session.create_stream(&settings()).unwrap();
        stream.connect(Duration::from_millis(100)).unwrap();

        let mut request = CaptureRequest::new(modes[0].clone());
        request.enable_stream(&stream);
        session.submit_repeating(&request).unwrap();

        let first = stream.acquire().unwrap();
        let second = stream.acquire().unwrap();
        assert_eq!((first.number, second.number), (1, 2));

        let plane = first.map_plane(0).unwrap();
        assert_eq!(plane.stride, 64);
        // Top-left is red
        assert_eq!(&plane.bytes[..2], &0x0c10u16.to_le_bytes());
        assert!(first.metadata.is_some());

        session.stop_repeating().unwrap();
        session.wait_idle(Duration::from_secs(1)).unwrap();
        stream.close();
        session.release().unwrap();

        let stats = backend.stats();
        assert_eq!(stats.frames_produced(), 2);
        assert_eq!(stats.sessions_released(), 1);
    }

    #[test]
    fn stalled_idle_times_out() {
        let mut backend = SyntheticBackend::new(SyntheticConfig {
            stall_idle: true,
            ..small()
        });
        backend.acquire().unwrap();
        let device = backend.enumerate_devices().unwrap().remove(0);
        let mut session = backend.open_session(&device).unwrap();

        assert!(matches!(
            session.wait_idle(Duration::from_millis(10)),
            Err(CaptureError::IdleTimeout(_))
        ));
    }
}
