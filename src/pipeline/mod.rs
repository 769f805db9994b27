pub mod fanout;
pub mod ringbuf;
pub mod supervisor;

pub use fanout::{Fanout, SinkStatus};
pub use ringbuf::FrameQueue;
pub use supervisor::{PipelineState, PipelineStatus, RecoveryPolicy, Supervisor, SupervisorConfig};

use crate::error::PipelineError;
use crate::sink::SinkHandle;

/// Reports flowing from the capture thread and sink dispatchers to the supervisor
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SinkInterrupted {
        handle: SinkHandle,
        error: PipelineError,
    },
    SinkRecovered {
        handle: SinkHandle,
        sink: String,
    },
    /// Non-fatal hardware drop
    FrameDrop(PipelineError),
    /// Capture stopped producing; the session must be torn down
    CaptureFault(PipelineError),
}
