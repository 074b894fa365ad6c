use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the shared vocabulary: configuration, value images, and the
/// row sources feeding a join.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A plan or program could not be serialized for fingerprinting.
    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    #[error("Malformed encoding at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("Row source error: {0}")]
    Source(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Fingerprint(e.to_string())
    }
}
