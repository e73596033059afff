//! V4L2 capture backend with memory-mapped buffers

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::fraction::Fraction;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::{
    CaptureBackend, CaptureMetadata, CaptureRequest, CaptureSession, DeviceInfo, Frame,
    FrameStream, ImagePlane, PixelFormat, Resolution, SensorMode, StreamProducer, StreamSettings,
};
use crate::error::{CaptureError, ConfigurationError, DeviceError, StreamError};

/// Highest /dev/videoN probed
const MAX_NODES: usize = 64;

/// Dequeue timeout, bounds how long a stop request can go unnoticed
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Raw16 => FourCC::new(b"RG16"),
        PixelFormat::Raw8 => FourCC::new(b"RGGB"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    [
        PixelFormat::Raw16,
        PixelFormat::Raw8,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Yuyv4,
        PixelFormat::Nv12,
        PixelFormat::Mjpeg,
    ]
    .into_iter()
    .find(|&f| self::fourcc(f) == fourcc)
}

/// Shortest frame period among the advertised intervals
fn shortest_interval(intervals: impl IntoIterator<Item = Fraction>) -> Duration {
    intervals
        .into_iter()
        .filter(|f| f.denominator != 0)
        .map(|f| Duration::from_secs_f64(f.numerator as f64 / f.denominator as f64))
        .min()
        .unwrap_or(Duration::ZERO)
}

/// V4L2 has no ISP between sensor and stream, so sensor modes are the
/// frame sizes of the one pixel format the stream will use.
pub struct V4l2Backend {
    buffer_count: u32,
    pixel_format: PixelFormat,
    acquired: bool,
    next_stream_id: Arc<AtomicU64>,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32, pixel_format: PixelFormat) -> Self {
        Self {
            buffer_count,
            pixel_format,
            acquired: false,
            next_stream_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn frame_duration(dev: &Device, fourcc: FourCC, width: u32, height: u32) -> Duration {
        match dev.enum_frameintervals(fourcc, width, height) {
            Ok(intervals) => shortest_interval(intervals.into_iter().map(|i| match i.interval {
                FrameIntervalEnum::Discrete(f) => f,
                FrameIntervalEnum::Stepwise(s) => s.min,
            })),
            Err(e) => {
                debug!("No frame intervals for {}x{}: {}", width, height, e);
                Duration::ZERO
            }
        }
    }
}

impl CaptureBackend for V4l2Backend {
    type Session = V4l2Session;

    fn name(&self) -> &str {
        "v4l2"
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        self.acquired = true;
        Ok(())
    }

    /// Probe video nodes with capture capability
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        info!("Auto-detecting capture devices...");

        let mut devices = Vec::new();
        for i in 0..MAX_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            if let Ok(caps) = dev.query_caps() {
                if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                    info!("Found capture device: {} - {}", path, caps.card);
                    devices.push(DeviceInfo {
                        index: devices.len(),
                        name: caps.card,
                        path,
                    });
                }
            }
        }
        Ok(devices)
    }

    fn list_sensor_modes(&self, device: &DeviceInfo) -> Result<Vec<SensorMode>, DeviceError> {
        let dev = Device::with_path(&device.path)?;
        let wanted = fourcc(self.pixel_format);

        let formats = dev.enum_formats()?;
        if !formats.iter().any(|desc| desc.fourcc == wanted) {
            let offered: Vec<String> = formats.iter().map(|d| d.fourcc.to_string()).collect();
            warn!(
                "{} does not offer {} (offers {})",
                device.path,
                wanted,
                offered.join(", ")
            );
            return Ok(Vec::new());
        }

        let mut modes = Vec::new();
        for size in dev.enum_framesizes(wanted)? {
            let FrameSizeEnum::Discrete(d) = size.size else {
                debug!("Skipping stepwise frame size range for {}", wanted);
                continue;
            };
            modes.push(SensorMode {
                index: modes.len(),
                resolution: Resolution::new(d.width, d.height),
                frame_duration: Self::frame_duration(&dev, wanted, d.width, d.height),
                format: self.pixel_format,
            });
        }
        Ok(modes)
    }

    fn open_session(&mut self, device: &DeviceInfo) -> Result<V4l2Session, DeviceError> {
        let dev = Device::with_path(&device.path).map_err(|e| DeviceError::Session {
            device: device.path.clone(),
            reason: e.to_string(),
        })?;
        let caps = dev.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Session {
                device: device.path.clone(),
                reason: "device doesn't support video capture".into(),
            });
        }

        Ok(V4l2Session {
            device: Arc::new(dev),
            path: device.path.clone(),
            buffer_count: self.buffer_count,
            next_stream_id: Arc::clone(&self.next_stream_id),
            stream: None,
            repeater: None,
        })
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.acquired = false;
        Ok(())
    }
}

struct Negotiated {
    stream: Arc<FrameStream>,
    producer: Option<StreamProducer>,
    format: Format,
}

struct Repeater {
    stop_tx: Option<Sender<()>>,
    idle_rx: Receiver<()>,
    handle: JoinHandle<StreamProducer>,
}

pub struct V4l2Session {
    device: Arc<Device>,
    path: String,
    buffer_count: u32,
    next_stream_id: Arc<AtomicU64>,
    stream: Option<Negotiated>,
    repeater: Option<Repeater>,
}

impl V4l2Session {
    fn reclaim(&mut self) {
        let Some(repeater) = self.repeater.take() else {
            return;
        };
        drop(repeater.stop_tx);
        match repeater.handle.join() {
            Ok(producer) => {
                if let Some(negotiated) = self.stream.as_mut() {
                    negotiated.producer = Some(producer);
                }
            }
            Err(_) => error!(device = %self.path, "Capture thread panicked"),
        }
    }
}

impl CaptureSession for V4l2Session {
    #[instrument(skip(self), fields(device = %self.path))]
    fn create_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Arc<FrameStream>, ConfigurationError> {
        if self.stream.is_some() {
            return Err(ConfigurationError::Stream(
                "V4L2 devices carry a single capture stream".into(),
            ));
        }

        let stream_err = |e: io::Error| ConfigurationError::Stream(e.to_string());

        // Set format
        let mut fmt = self.device.format().map_err(stream_err)?;
        fmt.width = settings.resolution.width;
        fmt.height = settings.resolution.height;
        fmt.fourcc = fourcc(settings.pixel_format);
        let fmt = self.device.set_format(&fmt).map_err(stream_err)?;

        if fmt.fourcc != fourcc(settings.pixel_format) {
            return Err(ConfigurationError::UnsupportedFormat(settings.pixel_format));
        }
        if fmt.width != settings.resolution.width || fmt.height != settings.resolution.height {
            warn!(
                "Driver adjusted resolution to {}x{}",
                fmt.width, fmt.height
            );
        }

        let negotiated = StreamSettings {
            resolution: Resolution::new(fmt.width, fmt.height),
            ..*settings
        };
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = FrameStream::new(id, negotiated);
        let producer = stream
            .attach_producer()
            .map_err(|e| ConfigurationError::Stream(e.to_string()))?;

        self.stream = Some(Negotiated {
            stream: Arc::clone(&stream),
            producer: Some(producer),
            format: fmt,
        });
        Ok(stream)
    }

    fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        if self.repeater.is_some() {
            return Err(CaptureError::AlreadyRepeating);
        }
        let negotiated = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Submit("no stream created".into()))?;
        if let Some(&id) = request.streams.iter().find(|&&id| id != negotiated.stream.id()) {
            return Err(CaptureError::UnknownStream(id));
        }
        if !request.enable_isp || !request.enable_post_processing {
            debug!("V4L2 has no ISP stage controls; flags ignored");
        }

        let producer = negotiated
            .producer
            .take()
            .ok_or_else(|| CaptureError::Submit("stream already streaming".into()))?;

        // Request buffers
        let mut mmap =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        mmap.set_timeout(DEQUEUE_TIMEOUT);
        info!(
            "Capture stream started with {} buffers",
            self.buffer_count
        );

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let (idle_tx, idle_rx) = channel::bounded::<()>(0);
        let format = negotiated.format.clone();
        let settings = *negotiated.stream.settings();

        let handle = thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || {
                let mut producer = producer;
                dequeue_loop(&mut mmap, &mut producer, &format, &settings, &stop_rx);
                drop(mmap);
                drop(idle_tx);
                producer
            })?;

        self.repeater = Some(Repeater {
            stop_tx: Some(stop_tx),
            idle_rx,
            handle,
        });
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), CaptureError> {
        if let Some(repeater) = self.repeater.as_mut() {
            repeater.stop_tx.take();
        }
        Ok(())
    }

    fn wait_idle(&mut self, timeout: Duration) -> Result<(), CaptureError> {
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
        self.reclaim();
        self.stream = None;
        Ok(())
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn dequeue_loop(
    mmap: &mut MmapStream<'static>,
    producer: &mut StreamProducer,
    format: &Format,
    settings: &StreamSettings,
    stop_rx: &Receiver<()>,
) {
    let mut number = 0u64;

    loop {
        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }

        let (buf, meta) = match mmap.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                error!("Dequeue failed: {}", e);
                return;
            }
        };

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        number += 1;

        let timestamp_ns =
            meta.timestamp.sec as u64 * 1_000_000_000 + meta.timestamp.usec as u64 * 1_000;
        let frame = buffer_frame(number, timestamp_ns, &buf[..used], format, settings);

        match producer.present_until(frame, stop_rx) {
            Ok(()) => {}
            Err(StreamError::Closed | StreamError::Cancelled) => return,
            Err(e) => {
                warn!("Dropping capture: {}", e);
                return;
            }
        }
    }
}

/// Copy a dequeued buffer into a single-plane frame
fn buffer_frame(
    number: u64,
    timestamp_ns: u64,
    data: &[u8],
    format: &Format,
    settings: &StreamSettings,
) -> Frame {
    Frame {
        number,
        timestamp_ns,
        format: settings.pixel_format,
        planes: vec![ImagePlane {
            width: format.width,
            height: format.height,
            stride: format.stride,
            data: Some(Bytes::copy_from_slice(data)),
        }],
        // Only the buffer timestamp is known per frame
        metadata: settings.metadata_enabled.then(|| CaptureMetadata {
            sensor_timestamp_ns: timestamp_ns,
            scene_lux: None,
            exposure_time: None,
            analog_gain: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_round_trips() {
        for format in [PixelFormat::Raw16, PixelFormat::Yuyv4, PixelFormat::Mjpeg] {
            assert_eq!(pixel_format(fourcc(format)), Some(format));
        }
        assert_eq!(pixel_format(FourCC::new(b"H264")), None);
    }

    #[test]
    fn buffer_timestamp_becomes_metadata() {
        let mut format = Format::new(4, 2, fourcc(PixelFormat::Raw16));
        format.stride = 8;
        let mut settings = StreamSettings {
            pixel_format: PixelFormat::Raw16,
            resolution: Resolution::new(4, 2),
            metadata_enabled: true,
        };

        let frame = buffer_frame(3, 42_000, &[0u8; 16], &format, &settings);
        assert_eq!(frame.number, 3);
        assert_eq!(frame.planes[0].stride, 8);
        let meta = frame.metadata.expect("metadata enabled");
        assert_eq!(meta.sensor_timestamp_ns, 42_000);
        assert_eq!(meta.scene_lux, None);

        settings.metadata_enabled = false;
        let frame = buffer_frame(4, 43_000, &[0u8; 16], &format, &settings);
        assert!(frame.metadata.is_none());
    }

    #[test]
    fn frame_duration_is_the_fastest_interval() {
        let intervals = [Fraction::new(1, 15), Fraction::new(1, 30), Fraction::new(1, 0)];
        assert_eq!(
            shortest_interval(intervals),
            Duration::from_secs_f64(1.0 / 30.0)
        );
        assert_eq!(shortest_interval(Vec::<Fraction>::new()), Duration::ZERO);
    }
}
