//! Capture Session: one open device, one negotiated format, a stream of frames

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{FormatSpec, Frame, FrameMetadata};
use crate::capture::registry::{DeviceDescriptor, DeviceProvider};
use crate::error::{PipelineError, Result};

/// One buffer as dequeued from a device
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub stride: u32,
    /// Driver-side frame counter, used to detect hardware drops
    pub device_sequence: Option<u64>,
    pub device_timestamp: Option<Duration>,
}

/// An open, streaming device
pub trait FrameSource: Send {
    /// Wait at most `wait` for the next buffer. `Ok(None)` when the wait elapsed empty.
    fn read(&mut self, wait: Duration) -> Result<Option<RawFrame>>;

    /// Release the device. Called at most once.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// No frame within this deadline is a `Timeout`
    pub frame_timeout: Duration,
    /// Longest single wait on the device before re-checking for cancellation
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub struct CaptureSession {
    device: DeviceDescriptor,
    format: FormatSpec,
    source: Option<Box<dyn FrameSource>>,
    config: SessionConfig,
    cancel: CancellationToken,
    sequence: u64,
    last_device_sequence: Option<u64>,
    frames_missed: u64,
}

impl CaptureSession {
    /// Open `device_id` in exactly `format`.
    ///
    /// The device is looked up in a fresh enumeration; a descriptor from an
    /// earlier enumeration is never trusted.
    pub fn open(
        provider: &dyn DeviceProvider,
        device_id: &str,
        format: FormatSpec,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let device = provider
            .enumerate()
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| PipelineError::DeviceUnavailable {
                device: device_id.to_string(),
                reason: "device not present".into(),
            })?;

        if !device.supports(&format) {
            return Err(PipelineError::FormatRejected {
                device: device.id.clone(),
                format,
            });
        }

        let source = provider.open(&device, format)?;
        info!(device = %device.id, name = %device.name, %format, "Capture session opened");

        Ok(Self {
            device,
            format,
            source: Some(source),
            config,
            cancel,
            sequence: 0,
            last_device_sequence: None,
            frames_missed: 0,
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn format(&self) -> FormatSpec {
        self.format
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// Frames the device reported lost over the life of this session
    pub fn frames_missed(&self) -> u64 {
        self.frames_missed
    }

    /// Block until the next frame.
    ///
    /// Fails with `Timeout` when nothing arrives within the frame deadline,
    /// `DeviceDisconnected` when the device vanished and `Cancelled` soon after
    /// the session's token is cancelled.
    #[instrument(level = "trace", skip(self), fields(device = %self.device.id))]
    pub fn next_frame(&mut self) -> Result<Frame> {
        let deadline = Instant::now() + self.config.frame_timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout {
                    device: self.device.id.clone(),
                    waited_ms: self.config.frame_timeout.as_millis() as u64,
                });
            }
            let wait = (deadline - now).min(self.config.poll_interval);

            let source = self
                .source
                .as_mut()
                .ok_or_else(|| PipelineError::DeviceDisconnected {
                    device: self.device.id.clone(),
                    reason: "session closed".into(),
                })?;

            if let Some(raw) = source.read(wait)? {
                return Ok(self.stamp(raw));
            }
        }
    }

    fn stamp(&mut self, raw: RawFrame) -> Frame {
        let missed = match (self.last_device_sequence, raw.device_sequence) {
            (Some(prev), Some(cur)) if cur > prev + 1 => cur - prev - 1,
            _ => 0,
        };
        if raw.device_sequence.is_some() {
            self.last_device_sequence = raw.device_sequence;
        }

        self.sequence += 1;
        if missed > 0 {
            self.frames_missed += missed;
            debug!(
                device = %self.device.id,
                missed,
                sequence = self.sequence,
                "Device dropped frames"
            );
        }

        Frame::new(
            raw.data,
            FrameMetadata {
                sequence: self.sequence,
                format: self.format,
                stride: raw.stride,
                missed_before: missed,
                device_timestamp: raw.device_timestamp,
            },
        )
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
            info!(
                device = %self.device.id,
                frames = self.sequence,
                missed = self.frames_missed,
                "Capture session closed"
            );
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.source.is_some() {
            warn!(device = %self.device.id, "Capture session dropped while open");
            self.close();
        }
    }
}
