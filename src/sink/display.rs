//! Display sink: keeps only the newest frame for the toolkit to present

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::capture::SharedFrame;
use crate::error::Result;
use crate::sink::FrameSink;

#[derive(Default)]
struct Slot {
    latest: ArcSwapOption<crate::capture::Frame>,
    /// Bumped on every accepted frame
    generation: AtomicU64,
    attached: AtomicBool,
}

/// Display Sink.
///
/// Frames are coalesced: if several arrive between two repaints only the
/// newest is shown and nothing queues up.
pub struct DisplaySink {
    name: String,
    slot: Arc<Slot>,
}

impl DisplaySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::new(Slot::default()),
        }
    }

    /// Handle for the windowing toolkit's repaint loop
    pub fn surface(&self) -> DisplaySurface {
        DisplaySurface {
            slot: self.slot.clone(),
            seen: 0,
        }
    }
}

impl FrameSink for DisplaySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, frame: SharedFrame) -> Result<()> {
        self.slot.attached.store(true, Ordering::Release);
        self.slot.latest.store(Some(frame));
        self.slot.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn detached(&self) {
        debug!(sink = %self.name, "Display detached");
        self.slot.attached.store(false, Ordering::Release);
        self.slot.latest.store(None);
    }
}

/// Drawable target handed to the windowing toolkit.
///
/// The toolkit owns the event loop and repaint cadence and pulls frames from here.
#[derive(Clone)]
pub struct DisplaySurface {
    slot: Arc<Slot>,
    seen: u64,
}

impl DisplaySurface {
    /// Newest frame, whether or not it was presented before
    pub fn latest(&self) -> Option<SharedFrame> {
        self.slot.latest.load_full()
    }

    /// Newest frame if it arrived since the last call
    pub fn take_new(&mut self) -> Option<SharedFrame> {
        let generation = self.slot.generation.load(Ordering::Acquire);
        if generation == self.seen {
            return None;
        }
        self.seen = generation;
        self.latest()
    }

    /// Frames accepted since the sink was created
    pub fn frames_accepted(&self) -> u64 {
        self.slot.generation.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        self.slot.attached.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FormatSpec, Frame, FrameMetadata, PixelFormat};
    use bytes::Bytes;

    fn frame(sequence: u64) -> SharedFrame {
        Arc::new(Frame::new(
            Bytes::from_static(&[0; 4]),
            FrameMetadata {
                sequence,
                format: FormatSpec::new(PixelFormat::Yuyv, 2, 1, 30),
                stride: 4,
                missed_before: 0,
                device_timestamp: None,
            },
        ))
    }

    #[test]
    fn coalesces_to_latest() {
        let sink = DisplaySink::new("display");
        let mut surface = sink.surface();
        assert!(surface.take_new().is_none());

        for seq in 1..=3 {
            sink.accept(frame(seq)).unwrap();
        }
        assert_eq!(surface.take_new().map(|f| f.sequence()), Some(3));
        assert!(surface.take_new().is_none());
        assert_eq!(surface.latest().map(|f| f.sequence()), Some(3));
        assert_eq!(surface.frames_accepted(), 3);
    }

    #[test]
    fn replaced_frames_are_released() {
        let sink = DisplaySink::new("display");
        let first = frame(1);
        sink.accept(first.clone()).unwrap();
        sink.accept(frame(2)).unwrap();
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn detach_clears_surface() {
        let sink = DisplaySink::new("display");
        let surface = sink.surface();
        sink.accept(frame(1)).unwrap();
        assert!(surface.is_attached());
        sink.detached();
        assert!(!surface.is_attached());
        assert!(surface.latest().is_none());
    }
}
