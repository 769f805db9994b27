//! Synthetic camera for hardware-free runs and tests.
//!
//! Devices can be plugged, unplugged, stalled and made to skip frames while
//! sessions are streaming from them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use crate::capture::frame::{FormatSpec, PixelFormat};
use crate::capture::registry::{DeviceDescriptor, DeviceProvider};
use crate::capture::session::{FrameSource, RawFrame};
use crate::error::{PipelineError, Result};

pub const SYNTHETIC_DEVICE: &str = "synthetic://0";

#[derive(Clone, Default)]
pub struct SyntheticProvider {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    /// Plug order is enumeration order
    devices: Vec<Device>,
    generation: u64,
    open_sources: HashMap<String, usize>,
}

struct Device {
    descriptor: DeviceDescriptor,
    generation: u64,
    stalled: bool,
    denied: bool,
    skip: u64,
}

impl SyntheticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single test-pattern camera at [`SYNTHETIC_DEVICE`]
    pub fn camera() -> Self {
        let provider = Self::new();
        provider.plug(
            SYNTHETIC_DEVICE,
            "Synthetic Test Pattern",
            vec![
                FormatSpec::new(PixelFormat::Yuyv, 640, 480, 30),
                FormatSpec::new(PixelFormat::Yuyv, 1280, 720, 30),
                FormatSpec::new(PixelFormat::Rgb24, 640, 480, 30),
            ],
        );
        provider
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug a device in. Replugging an id creates a new device instance.
    pub fn plug(&self, id: &str, name: &str, formats: Vec<FormatSpec>) {
        let mut state = self.lock();
        state.generation += 1;
        let generation = state.generation;
        state.devices.retain(|d| d.descriptor.id != id);
        state.devices.push(Device {
            descriptor: DeviceDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                driver: "synthetic".into(),
                formats,
            },
            generation,
            stalled: false,
            denied: false,
            skip: 0,
        });
        info!(device = id, "Synthetic device plugged");
    }

    pub fn unplug(&self, id: &str) {
        self.lock().devices.retain(|d| d.descriptor.id != id);
        info!(device = id, "Synthetic device unplugged");
    }

    /// Stop producing frames without reporting a disconnect
    pub fn stall(&self, id: &str, stalled: bool) {
        self.with_device(id, |d| d.stalled = stalled);
    }

    /// Make the next frame report `count` frames lost in hardware
    pub fn skip_frames(&self, id: &str, count: u64) {
        self.with_device(id, |d| d.skip += count);
    }

    /// Refuse opens as if the caller lacked permission
    pub fn deny(&self, id: &str, denied: bool) {
        self.with_device(id, |d| d.denied = denied);
    }

    /// Sources currently open on `id`
    pub fn open_sources(&self, id: &str) -> usize {
        self.lock().open_sources.get(id).copied().unwrap_or(0)
    }

    fn with_device(&self, id: &str, f: impl FnOnce(&mut Device)) {
        if let Some(device) = self.lock().devices.iter_mut().find(|d| d.descriptor.id == id) {
            f(device);
        }
    }
}

impl DeviceProvider for SyntheticProvider {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.lock()
            .devices
            .iter()
            .map(|d| d.descriptor.clone())
            .collect()
    }

    fn open(&self, device: &DeviceDescriptor, format: FormatSpec) -> Result<Box<dyn FrameSource>> {
        let mut state = self.lock();
        let generation = {
            let present = state
                .devices
                .iter()
                .find(|d| d.descriptor.id == device.id)
                .ok_or_else(|| PipelineError::DeviceUnavailable {
                    device: device.id.clone(),
                    reason: "device not present".into(),
                })?;
            if present.denied {
                return Err(PipelineError::PermissionDenied {
                    device: device.id.clone(),
                });
            }
            if !present.descriptor.supports(&format) {
                return Err(PipelineError::FormatRejected {
                    device: device.id.clone(),
                    format,
                });
            }
            present.generation
        };
        *state.open_sources.entry(device.id.clone()).or_default() += 1;

        Ok(Box::new(SyntheticSource {
            provider: self.clone(),
            id: device.id.clone(),
            generation,
            format,
            next_due: Instant::now(),
            device_sequence: 0,
            started: Instant::now(),
            closed: false,
        }))
    }
}

struct SyntheticSource {
    provider: SyntheticProvider,
    id: String,
    generation: u64,
    format: FormatSpec,
    next_due: Instant,
    device_sequence: u64,
    started: Instant,
    closed: bool,
}

impl FrameSource for SyntheticSource {
    fn read(&mut self, wait: Duration) -> Result<Option<RawFrame>> {
        let skip = {
            let mut state = self.provider.lock();
            let device = state
                .devices
                .iter_mut()
                .find(|d| d.descriptor.id == self.id && d.generation == self.generation)
                .ok_or_else(|| PipelineError::DeviceDisconnected {
                    device: self.id.clone(),
                    reason: "device removed".into(),
                })?;
            if device.stalled {
                None
            } else {
                Some(std::mem::take(&mut device.skip))
            }
        };

        let Some(skip) = skip else {
            std::thread::sleep(wait);
            return Ok(None);
        };

        let now = Instant::now();
        if self.next_due > now {
            let until_due = self.next_due - now;
            if until_due > wait {
                std::thread::sleep(wait);
                if skip > 0 {
                    self.provider.skip_frames(&self.id, skip);
                }
                return Ok(None);
            }
            std::thread::sleep(until_due);
        }
        self.next_due = self.next_due.max(now) + self.format.frame_interval();
        self.device_sequence += 1 + skip;

        let stride = self
            .format
            .pixel_format
            .packed_stride(self.format.width)
            .unwrap_or(0);
        Ok(Some(RawFrame {
            data: test_pattern(&self.format, self.device_sequence),
            stride,
            device_sequence: Some(self.device_sequence),
            device_timestamp: Some(self.started.elapsed()),
        }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.provider.lock();
        if let Some(count) = state.open_sources.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Moving vertical bars in the requested layout
fn test_pattern(format: &FormatSpec, tick: u64) -> Bytes {
    let (w, h) = (format.width as usize, format.height as usize);
    let shift = (tick as usize).wrapping_mul(4);
    let luma = |x: usize| (((x + shift) * 255 / w.max(1)) % 256) as u8;

    let data = match format.pixel_format {
        PixelFormat::Yuyv => {
            let mut buf = Vec::with_capacity(w * h * 2);
            for _ in 0..h {
                for x in (0..w).step_by(2) {
                    buf.extend_from_slice(&[luma(x), 128, luma(x + 1), 128]);
                }
            }
            buf
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let mut buf = Vec::with_capacity(w * h * 3);
            for y in 0..h {
                for x in 0..w {
                    buf.extend_from_slice(&[luma(x), (y * 255 / h.max(1)) as u8, 96]);
                }
            }
            buf
        }
        PixelFormat::Nv12 => {
            let mut buf = Vec::with_capacity(w * h * 3 / 2);
            for _ in 0..h {
                buf.extend((0..w).map(luma));
            }
            buf.resize(w * h * 3 / 2, 128);
            buf
        }
        // Markers only; not decodable
        PixelFormat::Mjpeg => vec![0xFF, 0xD8, 0xFF, 0xD9],
    };
    Bytes::from(data)
}
