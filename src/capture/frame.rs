use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::FrameMapError;

/// Pixel formats a stream can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Bayer, 16 bits per sample (little endian)
    Raw16,
    /// Bayer, 8 bits per sample
    Raw8,
    Rgb24,
    Bgr24,
    Yuyv4,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per sample for the given plane, `None` for compressed formats
    pub fn bytes_per_sample(self, plane: usize) -> Option<usize> {
        match (self, plane) {
            (PixelFormat::Raw16, 0) => Some(2),
            (PixelFormat::Raw8, 0) => Some(1),
            (PixelFormat::Rgb24 | PixelFormat::Bgr24, 0) => Some(3),
            (PixelFormat::Yuyv4, 0) => Some(2),
            // Y plane, then interleaved UV at half height
            (PixelFormat::Nv12, 0 | 1) => Some(1),
            _ => None,
        }
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    pub fn is_bayer(self) -> bool {
        matches!(self, PixelFormat::Raw16 | PixelFormat::Raw8)
    }
}

/// Width/height pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Per-capture sensor metadata. Fields a backend cannot report are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    pub sensor_timestamp_ns: u64,
    pub scene_lux: Option<f32>,
    pub exposure_time: Option<Duration>,
    pub analog_gain: Option<f32>,
}

/// One image plane as delivered by the backend.
///
/// `data` is `None` when the backend could not export the buffer, which the
/// consumer treats as a mapping failure.
#[derive(Debug, Clone)]
pub struct ImagePlane {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub data: Option<Bytes>,
}

/// Readable view of a plane, produced by [`ImagePlaneSource::map_plane`]
#[derive(Debug, Clone, Copy)]
pub struct MappedPlane<'a> {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bytes: &'a [u8],
}

impl<'a> MappedPlane<'a> {
    /// Iterate rows, each clipped to `row_bytes`
    pub fn rows(&self, row_bytes: usize) -> impl Iterator<Item = &'a [u8]> + 'a {
        let stride = self.stride as usize;
        let bytes = self.bytes;
        (0..self.height as usize).map(move |row| {
            let start = row * stride;
            &bytes[start..start + row_bytes]
        })
    }
}

/// Capability: access to image planes
pub trait ImagePlaneSource {
    fn plane_count(&self) -> usize;

    fn map_plane(&self, index: usize) -> Result<MappedPlane<'_>, FrameMapError>;

    /// Map all planes, failing on the first one that cannot be read
    fn map_planes(&self) -> Result<Vec<MappedPlane<'_>>, FrameMapError> {
        (0..self.plane_count()).map(|i| self.map_plane(i)).collect()
    }
}

/// Capability: access to capture metadata
pub trait MetadataSource {
    fn capture_metadata(&self) -> Option<&CaptureMetadata>;
}

/// Immutable capture result
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic, unique per stream
    pub number: u64,

    /// Sensor clock, nanoseconds
    pub timestamp_ns: u64,

    pub format: PixelFormat,
    pub planes: Vec<ImagePlane>,
    pub metadata: Option<CaptureMetadata>,
}

impl Frame {
    /// Minimum buffer length for a plane with the given geometry
    fn required_len(&self, index: usize, plane: &ImagePlane) -> usize {
        match self.format.bytes_per_sample(index) {
            Some(bps) if plane.height > 0 => {
                let row = plane.width as usize * bps;
                plane.stride as usize * (plane.height as usize - 1) + row
            }
            _ => 0,
        }
    }
}

impl ImagePlaneSource for Frame {
    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn map_plane(&self, index: usize) -> Result<MappedPlane<'_>, FrameMapError> {
        let plane = self.planes.get(index).ok_or(FrameMapError::NoSuchPlane {
            plane: index,
            count: self.planes.len(),
        })?;

        let data = plane
            .data
            .as_ref()
            .ok_or(FrameMapError::Unavailable { plane: index })?;

        let expected = self.required_len(index, plane);
        if data.len() < expected {
            return Err(FrameMapError::Truncated {
                plane: index,
                expected,
                actual: data.len(),
            });
        }

        Ok(MappedPlane {
            index,
            width: plane.width,
            height: plane.height,
            stride: plane.stride,
            bytes: data,
        })
    }
}

impl MetadataSource for Frame {
    fn capture_metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw16_frame(data: Option<Bytes>, stride: u32) -> Frame {
        Frame {
            number: 1,
            timestamp_ns: 0,
            format: PixelFormat::Raw16,
            planes: vec![ImagePlane {
                width: 4,
                height: 2,
                stride,
                data,
            }],
            metadata: None,
        }
    }

    #[test]
    fn maps_plane_with_stride_padding() {
        // 4 px * 2 bytes = 8 visible bytes per row, 10 byte stride
        let frame = raw16_frame(Some(Bytes::from(vec![0u8; 18])), 10);
        let planes = frame.map_planes().unwrap();
        assert_eq!(planes.len(), 1);

        let rows: Vec<_> = planes[0].rows(8).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.len() == 8));
    }

    #[test]
    fn missing_buffer_is_a_map_error() {
        let frame = raw16_frame(None, 8);
        assert_eq!(
            frame.map_plane(0).unwrap_err(),
            FrameMapError::Unavailable { plane: 0 }
        );
    }

    #[test]
    fn short_buffer_is_a_map_error() {
        let frame = raw16_frame(Some(Bytes::from(vec![0u8; 12])), 8);
        assert_eq!(
            frame.map_plane(0).unwrap_err(),
            FrameMapError::Truncated {
                plane: 0,
                expected: 16,
                actual: 12
            }
        );
    }

    #[test]
    fn out_of_range_plane() {
        let frame = raw16_frame(Some(Bytes::from(vec![0u8; 16])), 8);
        assert!(matches!(
            frame.map_plane(1),
            Err(FrameMapError::NoSuchPlane { plane: 1, count: 1 })
        ));
    }

    #[test]
    fn compressed_formats_have_no_sample_size() {
        assert_eq!(PixelFormat::Mjpeg.bytes_per_sample(0), None);
        assert_eq!(PixelFormat::Nv12.bytes_per_sample(1), Some(1));
        assert_eq!(PixelFormat::Raw16.bytes_per_sample(1), None);
    }
}
