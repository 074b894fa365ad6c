use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid join plan: {0}")]
    Invalid(String),

    #[error("join method disabled by configuration: {0}")]
    MethodDisabled(&'static str),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Core(#[from] gpujoin_core::error::Error),
}
