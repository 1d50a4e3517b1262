//! Error types for pullq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing queue service rejected or could not serve a request.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// Retiring a single item failed. Callers log this and move on.
    #[error("delete failed for item {id} in queue {queue}")]
    DeleteFailed { queue: String, id: i64 },

    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    #[error("batch of {len} items exceeds the cap of {cap}")]
    BatchTooLarge { len: usize, cap: usize },

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for infrastructure-level failures of the store or control queue.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Database(_))
    }

    /// Failures that rerunning the same input cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::BatchTooLarge { .. } | Error::InvalidQueueName(_) | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
