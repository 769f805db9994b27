//! V4L2 device enumeration and capture with memory-mapped buffers

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::PollFlags;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::buffers::{BufferCycle, BufferStream};
use crate::capture::frame::{FormatSpec, PixelFormat};
use crate::capture::registry::{DeviceDescriptor, DeviceProvider};
use crate::capture::session::{FrameSource, RawFrame};
use crate::error::{PipelineError, Result};

/// Upper bound on a dequeue once poll reported a filled buffer
const DEQUEUE_GRACE: Duration = Duration::from_secs(1);

/// Resolutions offered for drivers that only report a stepwise range
const STEPWISE_RESOLUTIONS: [(u32, u32); 3] = [(640, 480), (1280, 720), (1920, 1080)];

/// Capture devices under `/dev/video*`
pub struct V4l2Provider {
    dev_dir: PathBuf,
    buffer_count: u32,
}

impl V4l2Provider {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            buffer_count: buffer_count.max(2),
        }
    }

    fn device_nodes(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dev_dir) else {
            return Vec::new();
        };

        let mut nodes: Vec<(u32, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let index = name.strip_prefix("video")?.parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        nodes.sort();
        nodes.into_iter().map(|(_, path)| path).collect()
    }

    fn describe(path: &Path) -> io::Result<Option<DeviceDescriptor>> {
        let dev = Device::with_path(path)?;
        let caps = dev.query_caps()?;

        // Metadata nodes share the driver but cannot capture
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            debug!("Skipping {}: no video capture capability", path.display());
            return Ok(None);
        }

        let mut formats = Vec::new();
        for desc in dev.enum_formats()? {
            let Some(pixel_format) = PixelFormat::from_fourcc(&desc.fourcc.repr) else {
                debug!("Skipping unsupported format {} on {}", desc.fourcc, path.display());
                continue;
            };

            for (width, height) in frame_sizes(&dev, desc.fourcc) {
                for fps in frame_rates(&dev, desc.fourcc, width, height) {
                    formats.push(FormatSpec::new(pixel_format, width, height, fps));
                }
            }
        }

        Ok(Some(DeviceDescriptor {
            id: path.display().to_string(),
            name: caps.card,
            driver: caps.driver,
            formats,
        }))
    }
}

impl Default for V4l2Provider {
    fn default() -> Self {
        Self::new(4)
    }
}

fn frame_sizes(dev: &Device, fourcc: FourCC) -> Vec<(u32, u32)> {
    let mut sizes = Vec::new();
    match dev.enum_framesizes(fourcc) {
        Ok(list) => {
            for size in list {
                match size.size {
                    FrameSizeEnum::Discrete(d) => sizes.push((d.width, d.height)),
                    FrameSizeEnum::Stepwise(s) => {
                        for (w, h) in STEPWISE_RESOLUTIONS {
                            if (s.min_width..=s.max_width).contains(&w)
                                && (s.min_height..=s.max_height).contains(&h)
                            {
                                sizes.push((w, h));
                            }
                        }
                    }
                }
            }
        }
        Err(e) => debug!("Failed to enumerate frame sizes for {}: {}", fourcc, e),
    }
    sizes.dedup();
    sizes
}

fn frame_rates(dev: &Device, fourcc: FourCC, width: u32, height: u32) -> Vec<u32> {
    let mut rates = Vec::new();
    match dev.enum_frameintervals(fourcc, width, height) {
        Ok(intervals) => {
            for interval in intervals {
                match interval.interval {
                    FrameIntervalEnum::Discrete(f) if f.numerator > 0 => {
                        rates.push(f.denominator / f.numerator)
                    }
                    FrameIntervalEnum::Discrete(_) => {}
                    FrameIntervalEnum::Stepwise(step) => {
                        if step.max.numerator > 0 && step.min.numerator > 0 {
                            rates.push(step.max.denominator / step.max.numerator);
                            rates.push(step.min.denominator / step.min.numerator);
                        }
                    }
                }
            }
        }
        Err(e) => debug!("Failed to enumerate intervals for {} {}x{}: {}", fourcc, width, height, e),
    }
    rates.retain(|&fps| fps > 0);
    rates.dedup();
    rates
}

impl DeviceProvider for V4l2Provider {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.device_nodes()
            .iter()
            .filter_map(|path| match Self::describe(path) {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    None
                }
            })
            .collect()
    }

    fn open(&self, device: &DeviceDescriptor, format: FormatSpec) -> Result<Box<dyn FrameSource>> {
        let source = V4l2Source::open(&device.id, format, self.buffer_count)?;
        Ok(Box::new(source))
    }
}

/// Memory-mapped buffers of one open device
struct MmapBuffers {
    stream: MmapStream<'static>,
    stride: u32,
}

impl BufferStream for MmapBuffers {
    fn queue(&mut self, index: usize) -> io::Result<()> {
        CaptureStream::queue(&mut self.stream, index)
    }

    fn start(&mut self) -> io::Result<()> {
        self.stream.start()
    }

    fn readable(&mut self, wait: Duration) -> io::Result<bool> {
        let millis = i32::try_from(wait.as_millis()).unwrap_or(i32::MAX);
        Ok(self.stream.handle().poll(PollFlags::POLLIN.bits(), millis)? > 0)
    }

    fn cycle(&mut self) -> io::Result<RawFrame> {
        let stride = self.stride;
        let (buf, meta) = CaptureStream::next(&mut self.stream)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(RawFrame {
            data: Bytes::copy_from_slice(&buf[..used]),
            stride,
            device_sequence: Some(meta.sequence as u64),
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        })
    }

    fn reclaim(&mut self) -> io::Result<()> {
        CaptureStream::dequeue(&mut self.stream).map(|_| ())
    }
}

/// Streaming V4L2 capture
pub struct V4l2Source {
    path: String,
    _device: Box<Device>,
    buffers: Option<BufferCycle<MmapBuffers>>,
}

impl V4l2Source {
    fn open(path: &str, format: FormatSpec, buffer_count: u32) -> Result<Self> {
        info!("Opening V4L2 device {} as {}", path, format);

        let device = Device::with_path(path).map_err(|e| open_error(path, &e))?;

        let mut fmt = device.format().map_err(|e| open_error(path, &e))?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = FourCC::new(&format.pixel_format.fourcc());

        let rejected = || PipelineError::FormatRejected {
            device: path.to_string(),
            format,
        };

        let applied = device.set_format(&fmt).map_err(|e| match Errno::from_raw(e.raw_os_error().unwrap_or(0)) {
            Errno::EINVAL => rejected(),
            _ => open_error(path, &e),
        })?;

        // Drivers substitute the nearest mode instead of failing
        if applied.width != format.width
            || applied.height != format.height
            || applied.fourcc != fmt.fourcc
        {
            warn!(
                "{} substituted {}x{} {} for {}",
                path, applied.width, applied.height, applied.fourcc, format
            );
            return Err(rejected());
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(format.fps)) {
            warn!("{}: failed to set frame rate {}: {}", path, format.fps, e);
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count)
            .map_err(|e| open_error(path, &e))?;
        stream.set_timeout(DEQUEUE_GRACE);
        info!("Capture stream mapped with {} buffers", buffer_count);

        let buffers = MmapBuffers {
            stream,
            stride: applied.stride,
        };
        Ok(Self {
            path: path.to_string(),
            _device: Box::new(device),
            buffers: Some(BufferCycle::new(buffers, buffer_count as usize)),
        })
    }
}

impl FrameSource for V4l2Source {
    #[instrument(level = "trace", skip(self), fields(device = %self.path))]
    fn read(&mut self, wait: Duration) -> Result<Option<RawFrame>> {
        let buffers = self
            .buffers
            .as_mut()
            .ok_or_else(|| PipelineError::DeviceDisconnected {
                device: self.path.clone(),
                reason: "stream closed".into(),
            })?;
        buffers.read(&self.path, wait)
    }

    fn close(&mut self) {
        if self.buffers.take().is_some() {
            debug!("Released V4L2 buffers on {}", self.path);
        }
    }
}

/// Errors that mean the device is gone rather than momentarily busy
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENODEV | Errno::ENXIO | Errno::EIO | Errno::EPIPE | Errno::ESHUTDOWN)
    )
}

pub(crate) fn open_error(device: &str, err: &io::Error) -> PipelineError {
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::EACCES | Errno::EPERM) => PipelineError::PermissionDenied {
            device: device.to_string(),
        },
        _ => PipelineError::DeviceUnavailable {
            device: device.to_string(),
            reason: err.to_string(),
        },
    }
}
