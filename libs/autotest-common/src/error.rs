use thiserror::Error;

/// Errors surfaced by the job record store and the dispatcher.
///
/// Authorization and validation variants are meant for the caller; the
/// remaining ones are infrastructure failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("job {0} is already queued")]
    AlreadyQueued(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors caused by the request rather than the backend
    pub fn is_client_error(&self) -> bool {
        !matches!(self, StoreError::Redis(_) | StoreError::Serialization(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
