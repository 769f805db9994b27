use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame handed to sinks. Read-only; released when the last holder drops it.
pub type SharedFrame = Arc<Frame>;

/// Frame data with zero-copy semantics
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta,
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Dense per-session sequence, starting at 1
    pub sequence: u64,
    pub format: FormatSpec,
    pub stride: u32,
    /// Frames the device reported lost between the previous frame and this one
    pub missed_before: u64,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[serde(alias = "RGB3", alias = "RGB")]
    Rgb24,
    #[serde(alias = "BGR3", alias = "BGR")]
    Bgr24,
    Yuyv,
    #[serde(alias = "MJPG", alias = "JPEG")]
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// V4L2 FourCC code
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }

    /// Bytes per line for an unpadded buffer, None for compressed formats
    pub fn packed_stride(&self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv => Some(width * 2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(width * 3),
            PixelFormat::Nv12 => Some(width),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        f.write_str(std::str::from_utf8(&code).unwrap_or("????"))
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "MJPEG" => return Ok(PixelFormat::Mjpeg),
            "RGB24" | "RGB" => return Ok(PixelFormat::Rgb24),
            "BGR24" | "BGR" => return Ok(PixelFormat::Bgr24),
            _ => {}
        }
        let code: [u8; 4] = upper
            .as_bytes()
            .try_into()
            .map_err(|_| format!("unknown pixel format: {s}"))?;
        PixelFormat::from_fourcc(&code).ok_or_else(|| format!("unknown pixel format: {s}"))
    }
}

/// One concrete capture mode. Valid only if it exactly matches a device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatSpec {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl FormatSpec {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32, fps: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            fps,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl fmt::Display for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}@{}",
            self.pixel_format, self.width, self.height, self.fps
        )
    }
}
