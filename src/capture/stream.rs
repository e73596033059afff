//! Frame stream shared between a backend producer and the consumer worker
//!
//! Hand-off is a rendezvous: `present()` returns once the consumer has taken
//! the frame, so the only frame in flight is the one being processed and
//! nothing is ever queued inside the stream. Closing the stream is the
//! cancellation signal for every blocked call.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use crossbeam::utils::CachePadded;
use tracing::{debug, info};

use crate::capture::frame::{Frame, PixelFormat, Resolution};
use crate::error::{ConnectionError, StreamError};

/// Stream configuration requested from a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub pixel_format: PixelFormat,
    pub resolution: Resolution,
    pub metadata_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Created = 0,
    Connected = 1,
    /// Producer detached, stream still open
    Draining = 2,
    Closed = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Created,
            1 => StreamState::Connected,
            2 => StreamState::Draining,
            _ => StreamState::Closed,
        }
    }
}

#[derive(Default)]
struct Counters {
    presented: AtomicU64,
    acquired: AtomicU64,
    discarded: AtomicU64,
}

/// Snapshot of stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub presented: u64,
    pub acquired: u64,
    pub discarded: u64,
}

pub struct FrameStream {
    id: u64,
    settings: StreamSettings,
    state: AtomicU8,

    frames_rx: Receiver<Frame>,
    frames_tx: Mutex<Option<Sender<Frame>>>,

    attached_rx: Receiver<()>,
    attached_tx: Mutex<Option<Sender<()>>>,

    /// Dropping the sender disconnects every receiver clone, waking them all
    closed_rx: Receiver<()>,
    closed_tx: Mutex<Option<Sender<()>>>,

    counters: CachePadded<Counters>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded values are plain Options; a poisoned lock leaves them valid.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FrameStream {
    pub fn new(id: u64, settings: StreamSettings) -> Arc<Self> {
        let (frames_tx, frames_rx) = channel::bounded(0);
        let (attached_tx, attached_rx) = channel::bounded(1);
        let (closed_tx, closed_rx) = channel::bounded(0);

        Arc::new(Self {
            id,
            settings,
            state: AtomicU8::new(StreamState::Created as u8),
            frames_rx,
            frames_tx: Mutex::new(Some(frames_tx)),
            attached_rx,
            attached_tx: Mutex::new(Some(attached_tx)),
            closed_rx,
            closed_tx: Mutex::new(Some(closed_tx)),
            counters: CachePadded::new(Counters::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            presented: self.counters.presented.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attach the producer end. Called once by the owning session.
    pub fn attach_producer(self: &Arc<Self>) -> Result<StreamProducer, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let frames_tx = lock(&self.frames_tx)
            .take()
            .ok_or(StreamError::AlreadyAttached)?;

        if let Some(tx) = lock(&self.attached_tx).take() {
            // Capacity 1 and a single send, cannot block
            let _ = tx.try_send(());
        }

        debug!(stream = self.id, "Producer attached");
        Ok(StreamProducer {
            stream: Arc::clone(self),
            frames_tx,
            last_number: None,
        })
    }

    /// Consumer side: wait for the producer to attach
    pub fn connect(&self, timeout: Duration) -> Result<(), ConnectionError> {
        match self.state() {
            StreamState::Connected | StreamState::Draining => return Ok(()),
            StreamState::Closed => return Err(ConnectionError::Closed),
            StreamState::Created => {}
        }

        select! {
            recv(self.attached_rx) -> msg => {
                if msg.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
            recv(self.closed_rx) -> _ => return Err(ConnectionError::Closed),
            default(timeout) => return Err(ConnectionError::Timeout(timeout)),
        }

        if self.transition(StreamState::Created, StreamState::Connected) {
            info!(stream = self.id, "Stream connected");
            Ok(())
        } else if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            // Producer already came and went
            Ok(())
        }
    }

    /// Consumer side: block until a frame arrives or the stream closes.
    ///
    /// `None` means no more frames will ever be delivered.
    pub fn acquire(&self) -> Option<Frame> {
        if self.is_closed() {
            return None;
        }

        select! {
            recv(self.frames_rx) -> msg => match msg {
                Ok(frame) => {
                    // A completed hand-off is delivered even if close() raced it
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    Some(frame)
                }
                Err(_) => {
                    // Producer gone, nothing more can arrive; hold until closed
                    self.mark_draining();
                    let _ = self.closed_rx.recv();
                    None
                }
            },
            recv(self.closed_rx) -> _ => None,
        }
    }

    fn mark_draining(&self) {
        if self.transition(StreamState::Connected, StreamState::Draining) {
            debug!(stream = self.id, "Stream draining");
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        let previous = StreamState::from_u8(
            self.state.swap(StreamState::Closed as u8, Ordering::AcqRel),
        );
        if previous == StreamState::Closed {
            return;
        }

        lock(&self.closed_tx).take();
        lock(&self.attached_tx).take();
        // Unattached producer end, if any
        lock(&self.frames_tx).take();

        info!(stream = self.id, ?previous, "Stream closed");
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish()
    }
}

/// Producer end of a [`FrameStream`], held by the backend
pub struct StreamProducer {
    stream: Arc<FrameStream>,
    frames_tx: Sender<Frame>,
    last_number: Option<u64>,
}

impl StreamProducer {
    pub fn stream(&self) -> &Arc<FrameStream> {
        &self.stream
    }

    /// Hand a frame to the consumer, blocking until it is taken or the
    /// stream closes.
    pub fn present(&mut self, frame: Frame) -> Result<(), StreamError> {
        self.present_until(frame, &channel::never())
    }

    /// Like [`present`](Self::present), but gives up with
    /// [`StreamError::Cancelled`] once `cancel` yields or disconnects.
    pub fn present_until(&mut self, frame: Frame, cancel: &Receiver<()>) -> Result<(), StreamError> {
        if let Some(last) = self.last_number {
            if frame.number <= last {
                return Err(StreamError::NonMonotonic {
                    number: frame.number,
                    last,
                });
            }
        }
        if self.stream.is_closed() {
            return Err(self.discard(StreamError::Closed));
        }

        let number = frame.number;
        select! {
            send(self.frames_tx, frame) -> res => {
                res.map_err(|_| self.discard(StreamError::Closed))?;
            }
            recv(self.stream.closed_rx) -> _ => return Err(self.discard(StreamError::Closed)),
            recv(cancel) -> _ => return Err(self.discard(StreamError::Cancelled)),
        }

        self.last_number = Some(number);
        self.stream
            .counters
            .presented
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl StreamProducer {
    fn discard(&self, err: StreamError) -> StreamError {
        self.stream
            .counters
            .discarded
            .fetch_add(1, Ordering::Relaxed);
        err
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        debug!(stream = self.stream.id, "Producer detached");
        self.stream.mark_draining();
    }
}
