//! Transport error type shared by all adapters

/// A send or receive failure on one side of a session.
///
/// Adapters wrap their library's error text; the relay only logs it and
/// treats it as that side going away.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
