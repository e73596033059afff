//! Headerless raw file writer
//!
//! Pixel data only: planes in order, rows top to bottom, the visible bytes of
//! each row with stride padding dropped. Compressed formats are dumped as-is.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::FrameSink;
use crate::capture::{Frame, MappedPlane};
use crate::error::SinkError;
use crate::OutputConfig;

pub struct RawFileSink {
    directory: PathBuf,
    prefix: String,
    overwrite: bool,
    files_written: u64,
    bytes_written: u64,
}

impl RawFileSink {
    pub fn new(config: &OutputConfig) -> Result<Self, SinkError> {
        fs::create_dir_all(&config.directory)?;
        info!(
            directory = %config.directory.display(),
            overwrite = config.overwrite,
            "Raw file sink ready"
        );

        Ok(Self {
            directory: config.directory.clone(),
            prefix: config.file_prefix.clone(),
            overwrite: config.overwrite,
            files_written: 0,
            bytes_written: 0,
        })
    }

    /// Destination file for a frame
    pub fn path_for(&self, frame: &Frame) -> PathBuf {
        if self.overwrite {
            self.directory.join(format!("{}.raw", self.prefix))
        } else {
            self.directory
                .join(format!("{}_{:08}.raw", self.prefix, frame.number))
        }
    }

    pub fn files_written(&self) -> u64 {
        self.files_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_planes(
        path: &Path,
        frame: &Frame,
        planes: &[MappedPlane<'_>],
    ) -> Result<u64, SinkError> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut total = 0u64;

        for plane in planes {
            match frame.format.bytes_per_sample(plane.index) {
                Some(bps) => {
                    let row_bytes = plane.width as usize * bps;
                    for row in plane.rows(row_bytes) {
                        out.write_all(row)?;
                    }
                    total += (row_bytes * plane.height as usize) as u64;
                }
                None => {
                    out.write_all(plane.bytes)?;
                    total += plane.bytes.len() as u64;
                }
            }
        }

        out.flush()?;
        Ok(total)
    }
}

impl FrameSink for RawFileSink {
    fn write(&mut self, frame: &Frame, planes: &[MappedPlane<'_>]) -> Result<(), SinkError> {
        let path = self.path_for(frame);
        let bytes = Self::write_planes(&path, frame, planes)?;

        self.files_written += 1;
        self.bytes_written += bytes;
        metrics::counter!("rawcap_sink_bytes_total").increment(bytes);
        debug!(frame = frame.number, bytes, path = %path.display(), "Wrote raw file");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        info!(
            files = self.files_written,
            bytes = self.bytes_written,
            "Raw file sink finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ImagePlane, ImagePlaneSource, PixelFormat};
    use bytes::Bytes;

    fn frame(number: u64) -> Frame {
        // 2x2 Raw16 with a 6 byte stride: each row carries 2 padding bytes
        let data: Vec<u8> = vec![1, 2, 3, 4, 0xee, 0xee, 5, 6, 7, 8, 0xee, 0xee];
        Frame {
            number,
            timestamp_ns: 0,
            format: PixelFormat::Raw16,
            planes: vec![ImagePlane {
                width: 2,
                height: 2,
                stride: 6,
                data: Some(Bytes::from(data)),
            }],
            metadata: None,
        }
    }

    fn config(dir: &Path, overwrite: bool) -> OutputConfig {
        OutputConfig {
            directory: dir.to_path_buf(),
            file_prefix: "cap".into(),
            overwrite,
        }
    }

    #[test]
    fn writes_visible_bytes_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(&config(dir.path(), false)).unwrap();

        let f = frame(7);
        sink.write(&f, &f.map_planes().unwrap()).unwrap();

        let written = fs::read(dir.path().join("cap_00000007.raw")).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sink.bytes_written(), 8);
    }

    #[test]
    fn one_file_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(&config(dir.path(), false)).unwrap();

        for n in 1..=3 {
            let f = frame(n);
            sink.write(&f, &f.map_planes().unwrap()).unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
        assert_eq!(sink.files_written(), 3);
    }

    #[test]
    fn overwrite_keeps_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(&config(dir.path(), true)).unwrap();

        for n in 1..=3 {
            let f = frame(n);
            sink.write(&f, &f.map_planes().unwrap()).unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(dir.path().join("cap.raw").exists());
    }

    #[test]
    fn compressed_planes_are_dumped_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(&config(dir.path(), false)).unwrap();

        let f = Frame {
            format: PixelFormat::Mjpeg,
            ..frame(1)
        };
        sink.write(&f, &f.map_planes().unwrap()).unwrap();
        let written = fs::read(sink.path_for(&f)).unwrap();
        assert_eq!(written.len(), 12);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(&config(dir.path(), false)).unwrap();
        fs::remove_dir(dir.path()).unwrap();

        let f = frame(1);
        assert!(matches!(
            sink.write(&f, &f.map_planes().unwrap()),
            Err(SinkError::Io(_))
        ));
    }
}
