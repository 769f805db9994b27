mod buffers;
pub mod decoder;
pub mod frame;
pub mod registry;
pub mod session;
pub mod synthetic;
pub mod v4l2;

pub use frame::{FormatSpec, Frame, FrameMetadata, PixelFormat, SharedFrame};
pub use registry::{DeviceDescriptor, DeviceProvider, DeviceRegistry};
pub use session::{CaptureSession, FrameSource, RawFrame, SessionConfig};
pub use synthetic::SyntheticProvider;
pub use v4l2::V4l2Provider;
