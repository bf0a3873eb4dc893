use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or is misconfigured. Maps to a 503.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The statement failed after a connection was established. The
    /// transaction has already been rolled back when this is returned.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),
}

impl StorageError {
    pub fn connect(err: sqlx::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }

    pub fn execution(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            other => StorageError::QueryFailed(other.to_string()),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
