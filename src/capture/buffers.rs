//! Buffer rotation for memory-mapped streaming.
//!
//! Once streaming, the driver owns every queued buffer and we hold exactly one
//! dequeued buffer between reads. Only a held buffer may be queued again, so a
//! wait that elapses empty must leave the rotation untouched: we poll for a
//! filled buffer first and cycle only when one is ready.

use std::io;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::capture::session::RawFrame;
use crate::capture::v4l2::is_disconnect;
use crate::error::{PipelineError, Result};

/// Driver-side operations a [`BufferCycle`] drives
pub(crate) trait BufferStream {
    /// Hand buffer `index` to the driver
    fn queue(&mut self, index: usize) -> io::Result<()>;

    fn start(&mut self) -> io::Result<()>;

    /// Wait up to `wait` for a filled buffer
    fn readable(&mut self, wait: Duration) -> io::Result<bool>;

    /// Queue the held buffer, then dequeue the next filled one and copy it out
    fn cycle(&mut self) -> io::Result<RawFrame>;

    /// Dequeue a filled buffer without handing one back. Its contents are lost.
    fn reclaim(&mut self) -> io::Result<()>;
}

pub(crate) struct BufferCycle<S> {
    stream: S,
    /// Buffers requested; the driver may have granted fewer
    buffers: usize,
    streaming: bool,
    /// We own a dequeued buffer that the next cycle hands back
    held: bool,
}

impl<S: BufferStream> BufferCycle<S> {
    pub(crate) fn new(stream: S, buffers: usize) -> Self {
        Self {
            stream,
            buffers: buffers.max(2),
            streaming: false,
            held: false,
        }
    }

    /// Queue every buffer but the first, then start streaming
    fn prime(&mut self) -> io::Result<()> {
        let mut queued = 0;
        for index in 1..self.buffers {
            match self.stream.queue(index) {
                Ok(()) => queued += 1,
                // Fewer buffers granted than requested
                Err(e) if queued > 0 && e.raw_os_error() == Some(Errno::EINVAL as i32) => break,
                Err(e) => return Err(e),
            }
        }
        self.stream.start()?;
        self.streaming = true;
        self.held = true;
        debug!(queued, "Streaming started");
        Ok(())
    }

    /// Wait at most `wait` for the next frame. `Ok(None)` when none arrived.
    pub(crate) fn read(&mut self, device: &str, wait: Duration) -> Result<Option<RawFrame>> {
        let started = Instant::now();

        if !self.streaming {
            self.prime().map_err(|e| PipelineError::DeviceDisconnected {
                device: device.to_string(),
                reason: format!("failed to start streaming: {e}"),
            })?;
        }

        match self.try_read(wait) {
            Ok(frame) => Ok(frame),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) if is_disconnect(&e) => Err(PipelineError::DeviceDisconnected {
                device: device.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => {
                // Retried next slice; a persistent failure surfaces as a timeout
                debug!(device, "Dequeue failed: {}", e);
                if let Some(rest) = wait.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
                Ok(None)
            }
        }
    }

    fn try_read(&mut self, wait: Duration) -> io::Result<Option<RawFrame>> {
        if !self.stream.readable(wait)? {
            return Ok(None);
        }

        if !self.held {
            // A failed cycle may have left our buffer with the driver
            self.stream.reclaim()?;
            self.held = true;
            warn!("Reclaimed a capture buffer, one frame discarded");
            return Ok(None);
        }

        match self.stream.cycle() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                self.held = false;
                Err(e)
            }
        }
    }
}
