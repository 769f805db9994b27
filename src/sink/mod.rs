//! Frame consumers

pub mod detection;
pub mod display;
pub mod network;
#[cfg(feature = "gstreamer-pipeline")]
pub mod rtsp;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::capture::SharedFrame;
use crate::error::Result;
use crate::Config;

pub use detection::{DetectionSink, Detector, Overlay, RandomBoxes};
pub use display::{DisplaySink, DisplaySurface};
pub use network::{NetworkSink, Transport, TransportError};

/// Anything that consumes captured frames.
///
/// `accept` runs on the sink's own dispatcher thread, never on the capture
/// thread. Returning `StreamInterrupted` marks the sink impaired until a later
/// call succeeds.
pub trait FrameSink: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, frame: SharedFrame) -> Result<()>;

    /// Called once after the sink is removed from a fanout
    fn detached(&self) {}
}

/// Registration token returned by `Fanout::attach`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SinkHandle(pub(crate) u64);

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Sinks selected by the configuration
pub struct SinkSet {
    pub sinks: Vec<Arc<dyn FrameSink>>,
    /// Present when the display sink is enabled
    pub surface: Option<DisplaySurface>,
    /// Present when frame analysis is enabled
    pub overlay: Option<Overlay>,
}

/// Compose the sinks the configuration asks for.
///
/// The network sink needs the `gstreamer-pipeline` feature; without it an
/// enabled network section is logged and skipped.
pub fn compose(config: &Config) -> SinkSet {
    let mut sinks: Vec<Arc<dyn FrameSink>> = Vec::new();
    let mut surface = None;
    let mut overlay = None;

    if config.display.enabled {
        let display = DisplaySink::new("display");
        surface = Some(display.surface());
        sinks.push(Arc::new(display));
    }

    if config.detection.enabled {
        let detector = match config.detection.seed {
            Some(seed) => RandomBoxes::seeded(seed),
            None => RandomBoxes::new(),
        };
        let detection = DetectionSink::new("detection", Box::new(detector), &config.detection);
        overlay = Some(detection.overlay());
        sinks.push(Arc::new(detection));
    }

    if config.network.enabled {
        #[cfg(feature = "gstreamer-pipeline")]
        {
            let transport = rtsp::RtspTransport::new(&config.network);
            sinks.push(Arc::new(NetworkSink::new("rtsp", transport)));
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        tracing::warn!(
            location = %config.network.location,
            "Network streaming requested but built without gstreamer-pipeline"
        );
    }

    SinkSet {
        sinks,
        surface,
        overlay,
    }
}
