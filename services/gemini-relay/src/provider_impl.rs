//! Pool-backed key injection
//!
//! Implements the Provider trait over the rotation manager: each request draws
//! the next eligible key, and the lease handed back afterwards decides whether
//! the call counts against that key's quota. This is the rotating counterpart
//! to `StaticKeyProvider`.

use key_pool::RotationManager;
use provider::{
    CredentialPlacement, ErrorClassification, Lease, Provider, ProviderError, ProviderHealth,
    UpstreamRequest,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PooledKeyProvider {
    manager: Arc<RotationManager>,
    placement: CredentialPlacement,
}

impl PooledKeyProvider {
    pub fn new(manager: Arc<RotationManager>, placement: CredentialPlacement) -> Self {
        Self { manager, placement }
    }
}

impl Provider for PooledKeyProvider {
    fn id(&self) -> &str {
        "key-pool"
    }

    fn prepare_request<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = provider::Result<Option<Lease>>> + Send + 'a>> {
        Box::pin(async move {
            let selected = self.manager.select().await.map_err(|e| match e {
                key_pool::Error::Exhausted(summary) => ProviderError::PoolExhausted(summary),
                other => ProviderError::Internal(other.to_string()),
            })?;

            if !self.placement.apply(request, &selected.secret)? {
                // Nothing to charge: the upstream never saw this key
                warn!(key = %selected.label, "no key placeholder in request body, forwarding without a key");
                return Ok(None);
            }
            debug!(key = %selected.label, "key attached to upstream request");

            Ok(Some(Lease {
                index: selected.index,
                label: selected.label,
            }))
        })
    }

    fn classify_error(&self, status: u16, body: &str) -> ErrorClassification {
        key_pool::classify_status(status, body)
    }

    fn report_success(&self, lease: Lease) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.manager.record_use(lease.index).await;
        })
    }

    fn report_error(
        &self,
        lease: Lease,
        classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match classification {
                ErrorClassification::QuotaExceeded => {
                    self.manager.mark_exhausted(lease.index).await;
                }
                ErrorClassification::Permanent => {
                    warn!(key = %lease.label, "upstream rejected key, check that it is valid");
                }
                // Failed calls never count against quota
                ErrorClassification::Transient => {}
            }
        })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async move {
            let pool_health = self.manager.health().await;
            let status = pool_health
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unhealthy")
                .to_string();
            ProviderHealth {
                status,
                pool: Some(pool_health),
            }
        })
    }
}
