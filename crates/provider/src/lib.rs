//! Credential injection for upstream requests
//!
//! Defines the `Provider` trait that decouples the HTTP forwarding path from
//! how the upstream key is obtained. `StaticKeyProvider` injects one fixed key;
//! the pooled provider in the service crate draws keys from the rotation
//! manager and accounts for them after the upstream call.

pub mod placement;
pub mod static_key;

pub use placement::CredentialPlacement;
pub use static_key::StaticKeyProvider;

use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream errors, used to decide what happens to the key.
///
/// - QuotaExceeded retires the key until its counter resets
/// - Permanent means the key itself is bad (logged, left in place)
/// - Transient needs no action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    QuotaExceeded,
    Permanent,
}

/// Health status reported by a provider for the /health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    /// "healthy", "degraded", or "unhealthy"
    pub status: String,
    /// Pool details when keys rotate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_json::Value>,
}

/// Errors from preparing an upstream request.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("key pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Outbound request under construction. The provider may rewrite the URL
/// query or the body to carry the key.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: reqwest::Url,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

/// Handle for the key that served a request, returned by `prepare_request`
/// and handed back once the upstream outcome is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub index: usize,
    pub label: String,
}

/// Abstraction over upstream credential strategies.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Identifier for logging and health reporting
    fn id(&self) -> &str;

    /// Attach a key to the request. Returns a lease when the key came from a
    /// pool and its usage must be accounted for afterwards.
    fn prepare_request<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Lease>>> + Send + 'a>>;

    /// Classify an upstream error response.
    fn classify_error(&self, status: u16, body: &str) -> ErrorClassification;

    /// The upstream answered with a non-error status using this lease.
    fn report_success(&self, lease: Lease) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// The upstream answered with an error status using this lease.
    fn report_error(
        &self,
        lease: Lease,
        classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Provider health for the /health endpoint.
    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>>;
}
