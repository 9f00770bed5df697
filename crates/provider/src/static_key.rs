//! Single fixed key, no rotation.
//!
//! Used when the deployment configures exactly one key or disables rotation.
//! No usage is tracked, so there is never a lease to account for.

use crate::{
    CredentialPlacement, ErrorClassification, Lease, Provider, ProviderHealth, UpstreamRequest,
};
use common::Secret;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

pub struct StaticKeyProvider {
    key: Secret<String>,
    placement: CredentialPlacement,
}

impl StaticKeyProvider {
    pub fn new(key: Secret<String>, placement: CredentialPlacement) -> Self {
        Self { key, placement }
    }
}

impl Provider for StaticKeyProvider {
    fn id(&self) -> &str {
        "static"
    }

    fn prepare_request<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = crate::Result<Option<Lease>>> + Send + 'a>> {
        let result = self.placement.apply(request, &self.key).map(|_| None);
        Box::pin(async move { result })
    }

    fn classify_error(&self, status: u16, _body: &str) -> ErrorClassification {
        // Nothing to rotate to; 401/403 are still worth a warning.
        if status == 401 || status == 403 {
            warn!(status, "upstream rejected the configured key");
            return ErrorClassification::Permanent;
        }
        ErrorClassification::Transient
    }

    fn report_success(&self, _lease: Lease) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn report_error(
        &self,
        _lease: Lease,
        _classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async {
            ProviderHealth {
                status: "healthy".to_string(),
                pool: None,
            }
        })
    }
}
