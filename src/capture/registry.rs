//! Capture device enumeration and format validation

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::capture::frame::FormatSpec;
use crate::capture::session::FrameSource;
use crate::error::Result;

/// Snapshot of one capture device as seen by a single enumeration.
///
/// Descriptors carry no identity across enumerations: a device that was
/// unplugged and replugged yields a new descriptor even if `id` is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Device path or index
    pub id: String,
    pub name: String,
    pub driver: String,
    /// Supported modes, in the order the driver reported them
    pub formats: Vec<FormatSpec>,
}

impl DeviceDescriptor {
    pub fn supports(&self, format: &FormatSpec) -> bool {
        self.formats.iter().any(|f| f == format)
    }
}

/// The operating system's capture subsystem
pub trait DeviceProvider: Send + Sync {
    /// Devices present right now, freshly queried
    fn enumerate(&self) -> Vec<DeviceDescriptor>;

    /// Open `device` streaming exactly `format`
    fn open(&self, device: &DeviceDescriptor, format: FormatSpec) -> Result<Box<dyn FrameSource>>;
}

/// Device Registry
#[derive(Clone)]
pub struct DeviceRegistry {
    provider: Arc<dyn DeviceProvider>,
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &dyn DeviceProvider {
        self.provider.as_ref()
    }

    /// Enumerate devices. Never cached; an empty list means no hardware.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        let devices = self.provider.enumerate();
        debug!(count = devices.len(), "Enumerated capture devices");
        devices
    }

    pub fn find(&self, device_id: &str) -> Option<DeviceDescriptor> {
        self.enumerate().into_iter().find(|d| d.id == device_id)
    }

    /// True iff `format` is in the device's current capability list
    pub fn validate(&self, device_id: &str, format: &FormatSpec) -> bool {
        self.find(device_id)
            .map(|device| device.supports(format))
            .unwrap_or(false)
    }
}
