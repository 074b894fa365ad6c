use gpujoin_core::id::{EventId, StreamId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown device {0}")]
    UnknownDevice(usize),

    #[error("Unknown {0}")]
    UnknownStream(StreamId),

    #[error("Unknown {0}")]
    UnknownEvent(EventId),

    #[error("Invalid device pointer: {0}")]
    InvalidPointer(String),

    /// The request exceeds the largest single allocation the device offers.
    #[error("Allocation of {requested} bytes exceeds the device maximum of {max} bytes")]
    AllocTooLarge { requested: usize, max: usize },

    #[error("Kernel launch failed: {0}")]
    Launch(String),

    /// A kernel aborted while running on the device.
    #[error("Kernel {kernel} faulted: {reason}")]
    KernelFault { kernel: String, reason: String },

    #[error("Host buffer error: {0}")]
    HostBuffer(String),

    #[error("Core error: {0}")]
    Core(#[from] gpujoin_core::error::Error),
}
