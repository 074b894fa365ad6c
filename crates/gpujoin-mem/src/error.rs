use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A pool could not cover an allocation. Device pools surface this as
    /// exhaustion rather than as an error.
    #[error("pool '{tag}' cannot hold {requested} more bytes ({used} of {capacity} in use)")]
    BudgetExceeded {
        tag: &'static str,
        requested: usize,
        capacity: usize,
        used: usize,
    },

    #[error("spill storage: {0}")]
    Storage(String),

    #[error("spill codec '{0}' is not compiled in")]
    CodecUnsupported(&'static str),

    #[error("spill codec: {0}")]
    Codec(String),

    #[error("spill segment '{0}' failed its checksum")]
    ChecksumMismatch(String),
}
