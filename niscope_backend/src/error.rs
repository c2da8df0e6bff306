use thiserror::Error;

use nisession_backend::DaqError;

pub type ScopeResult<T> = Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error(transparent)]
    Daq(#[from] DaqError),

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("poll worker: {0}")]
    Worker(String),
}
