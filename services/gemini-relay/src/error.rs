//! Service-specific error types

use std::net::SocketAddr;
use thiserror::Error;

/// Startup errors.
///
/// Per-request failures (auth, upstream timeout, exhaustion) are answered
/// directly as HTTP responses by the proxy handler and never propagate as
/// Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Key pool setup failed: {0}")]
    KeyPool(#[from] key_pool::Error),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
