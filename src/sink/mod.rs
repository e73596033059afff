//! Frame persistence

pub mod raw;

pub use raw::RawFileSink;

use crate::capture::{Frame, MappedPlane};
use crate::error::SinkError;

/// Persists frames handed over by the consumer worker.
///
/// Called from the worker thread only, one frame at a time, in acquisition
/// order. A returned error stops the pipeline.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame, planes: &[MappedPlane<'_>]) -> Result<(), SinkError>;

    /// Called once after the last frame
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn write(&mut self, frame: &Frame, planes: &[MappedPlane<'_>]) -> Result<(), SinkError> {
        (**self).write(frame, planes)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }
}
