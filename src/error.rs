use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("optimistic write lost a race on {resource:?}")]
    Conflict { resource: String },

    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("lease expired for {resource:?}")]
    Expired { resource: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
