pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod sink;

use std::path::Path;

use capture::frame::{FormatSpec, PixelFormat};
use serde::{Deserialize, Serialize};

pub use error::{PipelineError, Result};
pub use pipeline::{PipelineState, PipelineStatus, Supervisor, SupervisorConfig};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub detection: DetectionConfig,
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// No frame within this deadline counts as one timeout
    pub frame_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    /// Pin the capture thread (embedded targets)
    pub cpu_core: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            frame_timeout_ms: 2000,
            max_consecutive_timeouts: 3,
            cpu_core: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub title: String,
    /// Mirror the preview top to bottom
    pub flip_vertical: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 640,
            height: 480,
            title: "vidrelay".into(),
            flip_vertical: false,
        }
    }
}

/// Frame analysis sink feeding the preview overlay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    /// Frames are downscaled to this size before analysis
    pub width: u32,
    pub height: u32,
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes are merged
    pub nms_threshold: f32,
    /// Fixed seed for the random-box detector
    pub seed: Option<u64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 320,
            height: 240,
            confidence_threshold: 0.65,
            nms_threshold: 0.45,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// RTSP server to publish to
    pub location: String,
    pub bitrate_kbps: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            location: "rtsp://127.0.0.1:8554/vidrelay".into(),
            bitrate_kbps: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sink_queue_depth: usize,
    pub poll_interval_ms: u64,
    /// A sink still busy after this long is abandoned on detach
    pub detach_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sink_queue_depth: 4,
            poll_interval_ms: 50,
            detach_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub auto_retry: bool,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then `VIDRELAY__SECTION__KEY` variables
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("VIDRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Capture format requested by the `capture` section
    pub fn format_spec(&self) -> FormatSpec {
        FormatSpec::new(
            self.capture.format,
            self.capture.width,
            self.capture.height,
            self.capture.fps,
        )
    }
}
