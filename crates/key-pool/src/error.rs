//! Error types for key pool operations

/// Errors from key pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool is empty")]
    EmptyPool,

    #[error("invalid quota policy: {0}")]
    InvalidPolicy(String),

    #[error("all keys exhausted: {0}")]
    Exhausted(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
