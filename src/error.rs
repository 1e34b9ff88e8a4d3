use thiserror::Error;

/// Errors returned by the queue, worker and facade.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("no handler registered for job '{0}'")]
    UnregisteredJob(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("system clock error: {0}")]
    Clock(#[from] std::time::SystemTimeError),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
