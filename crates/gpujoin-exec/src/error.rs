use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A device allocation failed; the task stays queued.
    #[error("device memory exhausted")]
    OutOfResource,

    /// A result buffer overflowed; the task is resized and retried.
    #[error("result buffer too small")]
    NoSpace,

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Device error: {0}")]
    Device(#[from] gpujoin_device::Error),

    #[error("A {size} byte row cannot fit the inner budget of {limit} bytes")]
    PartitionImpossible { size: usize, limit: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Entry point '{0}' is missing from the device program")]
    MissingEntryPoint(String),

    #[error("Spill error: {0}")]
    Spill(#[from] gpujoin_mem::error::Error),

    #[error("Plan error: {0}")]
    Plan(#[from] gpujoin_planner::Error),

    #[error("Storage error: {0}")]
    Io(#[from] gpujoin_io::Error),

    #[error(transparent)]
    Core(#[from] gpujoin_core::error::Error),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    /// Errors handled inside the executor that never reach the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfResource | Error::NoSpace)
    }
}
