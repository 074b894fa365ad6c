use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line {line}, column '{column}': {reason}")]
    Parse {
        line: u64,
        column: String,
        reason: String,
    },

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] gpujoin_core::error::Error),

    #[error(transparent)]
    Mem(#[from] gpujoin_mem::error::Error),
}

impl From<Error> for gpujoin_core::error::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Core(inner) => inner,
            other => gpujoin_core::error::Error::Source(other.to_string()),
        }
    }
}
