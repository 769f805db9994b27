//! Network sink: hands frames to a streaming transport

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

use crate::capture::{FormatSpec, Frame, SharedFrame};
use crate::error::{PipelineError, Result};
use crate::sink::FrameSink;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Network streaming session (RTSP publisher or similar)
pub trait Transport: Send {
    /// Open a session for frames of `format`
    fn start(&mut self, format: &FormatSpec) -> Result<(), TransportError>;

    /// Submit one frame. Must not block longer than a frame interval.
    fn submit(&mut self, frame: &Frame) -> Result<(), TransportError>;

    fn stop(&mut self);
}

enum Link {
    Down,
    Up(FormatSpec),
}

struct Inner {
    transport: Box<dyn Transport>,
    link: Link,
}

/// Network Sink.
///
/// A transport failure is reported as `StreamInterrupted`; the sink keeps
/// accepting frames and reopens the session on the next one.
pub struct NetworkSink {
    name: String,
    inner: Mutex<Inner>,
    sent: AtomicU64,
    failures: AtomicU64,
}

impl NetworkSink {
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                transport: Box::new(transport),
                link: Link::Down,
            }),
            sent: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn interrupted(&self, inner: &mut Inner, err: TransportError) -> PipelineError {
        inner.transport.stop();
        inner.link = Link::Down;
        self.failures.fetch_add(1, Ordering::Relaxed);
        PipelineError::StreamInterrupted {
            sink: self.name.clone(),
            reason: err.0,
        }
    }
}

impl FrameSink for NetworkSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, frame: SharedFrame) -> Result<()> {
        let format = frame.meta.format;
        let mut inner = self.inner();

        let up = matches!(inner.link, Link::Up(current) if current == format);
        if !up {
            if let Link::Up(previous) = inner.link {
                info!(sink = %self.name, from = %previous, to = %format, "Format changed, restarting stream");
                inner.transport.stop();
                inner.link = Link::Down;
            }
            if let Err(e) = inner.transport.start(&format) {
                return Err(self.interrupted(&mut inner, e));
            }
            info!(sink = %self.name, %format, "Stream session started");
            inner.link = Link::Up(format);
        }

        match inner.transport.submit(&frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!(sink = %self.name, sequence = frame.sequence(), "Transmit failed: {}", e);
                Err(self.interrupted(&mut inner, e))
            }
        }
    }

    fn detached(&self) {
        let mut inner = self.inner();
        if let Link::Up(_) = inner.link {
            inner.transport.stop();
            inner.link = Link::Down;
            info!(sink = %self.name, "Stream session stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeLink {
        down: Arc<AtomicBool>,
        starts: Arc<AtomicU64>,
        stops: Arc<AtomicU64>,
        submitted: Arc<AtomicU64>,
    }

    impl Transport for FakeLink {
        fn start(&mut self, _format: &FormatSpec) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError("connection refused".into()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn submit(&mut self, _frame: &Frame) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError("broken pipe".into()));
            }
            self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(sequence: u64, width: u32) -> SharedFrame {
        Arc::new(Frame::new(
            Bytes::from_static(&[0; 4]),
            FrameMetadata {
                sequence,
                format: FormatSpec::new(PixelFormat::Yuyv, width, 1, 30),
                stride: width * 2,
                missed_before: 0,
                device_timestamp: None,
            },
        ))
    }

    #[test]
    fn starts_once_and_transmits() {
        let link = FakeLink::default();
        let sink = NetworkSink::new("rtsp", link.clone());
        for seq in 1..=3 {
            sink.accept(frame(seq, 2)).unwrap();
        }
        assert_eq!(link.starts.load(Ordering::SeqCst), 1);
        assert_eq!(link.submitted.load(Ordering::SeqCst), 3);
        assert_eq!(sink.frames_sent(), 3);
    }

    #[test]
    fn failure_interrupts_then_recovers() {
        let link = FakeLink::default();
        let sink = NetworkSink::new("rtsp", link.clone());
        sink.accept(frame(1, 2)).unwrap();

        link.down.store(true, Ordering::SeqCst);
        let err = sink.accept(frame(2, 2)).unwrap_err();
        assert!(matches!(err, PipelineError::StreamInterrupted { ref sink, .. } if sink == "rtsp"));
        // Still accepting, still failing while the link is down
        assert!(sink.accept(frame(3, 2)).is_err());
        assert_eq!(sink.failures(), 2);

        link.down.store(false, Ordering::SeqCst);
        sink.accept(frame(4, 2)).unwrap();
        assert_eq!(link.starts.load(Ordering::SeqCst), 2);
        assert_eq!(sink.frames_sent(), 2);
    }

    #[test]
    fn format_change_restarts_session() {
        let link = FakeLink::default();
        let sink = NetworkSink::new("rtsp", link.clone());
        sink.accept(frame(1, 2)).unwrap();
        sink.accept(frame(1, 4)).unwrap();
        assert_eq!(link.starts.load(Ordering::SeqCst), 2);
        assert_eq!(link.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_stops_open_session() {
        let link = FakeLink::default();
        let sink = NetworkSink::new("rtsp", link.clone());
        sink.detached();
        assert_eq!(link.stops.load(Ordering::SeqCst), 0);
        sink.accept(frame(1, 2)).unwrap();
        sink.detached();
        assert_eq!(link.stops.load(Ordering::SeqCst), 1);
    }
}
