//! Pipeline error taxonomy

use thiserror::Error;

use crate::capture::FormatSpec;
use crate::pipeline::PipelineState;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// How an error is handled by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad device/format choice; surfaced immediately, never retried
    Configuration,
    /// Hardware went away or stopped producing; recovered by the supervisor
    Transient,
    /// Reported and counted, never fatal
    Diagnostic,
    /// One consumer is unhappy, capture continues
    SinkLocal,
    /// Caller misuse
    Programming,
    /// Stop requests and invalid commands
    Control,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("device {device} does not offer format {format}")]
    FormatRejected { device: String, format: FormatSpec },

    #[error("permission denied opening {device}")]
    PermissionDenied { device: String },

    #[error("device {device} disconnected: {reason}")]
    DeviceDisconnected { device: String, reason: String },

    #[error("no frame from {device} within {waited_ms} ms")]
    Timeout { device: String, waited_ms: u64 },

    #[error("device {device} dropped {missed} frame(s) before sequence {sequence}")]
    FrameDrop {
        device: String,
        missed: u64,
        sequence: u64,
    },

    #[error("sink {sink} interrupted: {reason}")]
    StreamInterrupted { sink: String, reason: String },

    #[error("sink {sink} is already attached")]
    SinkAttachConflict { sink: String },

    #[error("no sinks to deliver frames to")]
    NoSinks,

    #[error("cannot {action} while pipeline is {state:?}")]
    InvalidState {
        action: &'static str,
        state: PipelineState,
    },

    #[error("capture cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::DeviceUnavailable { .. }
            | PipelineError::FormatRejected { .. }
            | PipelineError::PermissionDenied { .. }
            | PipelineError::NoSinks => ErrorClass::Configuration,
            PipelineError::DeviceDisconnected { .. } | PipelineError::Timeout { .. } => {
                ErrorClass::Transient
            }
            PipelineError::FrameDrop { .. } => ErrorClass::Diagnostic,
            PipelineError::StreamInterrupted { .. } => ErrorClass::SinkLocal,
            PipelineError::SinkAttachConflict { .. } => ErrorClass::Programming,
            PipelineError::InvalidState { .. } | PipelineError::Cancelled => ErrorClass::Control,
        }
    }

    /// True for faults the supervisor tears down and retries on its own
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
