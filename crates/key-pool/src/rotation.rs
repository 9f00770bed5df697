//! Round-robin key selection with quota headroom and age-based reset
//!
//! The manager owns the `CredentialPool` behind a single async mutex. Every
//! read-modify-write (stale reset, scan, cursor advance, usage recording)
//! happens inside one critical section with no await point in the middle, so
//! concurrent request tasks always observe a consistent pool.

use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::{CredentialPool, label};

/// Quota thresholds applied to every key.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    /// Keys at or above this count are skipped.
    pub warning_threshold: u32,
    /// Provider's hard daily limit. Quota 429s raise a key to this count.
    pub daily_limit: u32,
    /// Idle time after which a key's counter resets.
    pub reset_after: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            warning_threshold: 45,
            daily_limit: 50,
            reset_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QuotaPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.warning_threshold == 0 {
            return Err(Error::InvalidPolicy(
                "warning_threshold must be greater than 0".into(),
            ));
        }
        if self.warning_threshold > self.daily_limit {
            return Err(Error::InvalidPolicy(format!(
                "warning_threshold ({}) must not exceed daily_limit ({})",
                self.warning_threshold, self.daily_limit
            )));
        }
        if self.reset_after.is_zero() {
            return Err(Error::InvalidPolicy(
                "reset_after must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A key chosen for one upstream request.
///
/// Pass its `index` to `record_use` once the upstream call succeeded.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub index: usize,
    pub label: String,
    pub secret: Secret<String>,
}

pub struct RotationManager {
    pool: Mutex<CredentialPool>,
    policy: QuotaPolicy,
}

impl RotationManager {
    pub fn new(pool: CredentialPool, policy: QuotaPolicy) -> Result<Self> {
        policy.validate()?;
        info!(
            keys = pool.len(),
            warning_threshold = policy.warning_threshold,
            daily_limit = policy.daily_limit,
            reset_after_secs = policy.reset_after.as_secs(),
            "key pool initialized"
        );
        Ok(Self {
            pool: Mutex::new(pool),
            policy,
        })
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Select the next key below the warning threshold.
    ///
    /// Stale counters are reset first. The scan starts at the cursor and wraps
    /// once; the cursor then moves past the chosen key so consecutive calls
    /// rotate through the pool. Selection alone does not count as usage.
    pub async fn select(&self) -> Result<SelectedCredential> {
        let now = Instant::now();
        let mut pool = self.pool.lock().await;
        reset_stale_locked(&mut pool, &self.policy, now);

        let n = pool.len();
        let start = pool.cursor();
        for offset in 0..n {
            let index = (start + offset) % n;
            let Some(credential) = pool.get(index) else {
                continue;
            };
            if credential.request_count() >= self.policy.warning_threshold {
                continue;
            }

            let selected = SelectedCredential {
                index,
                label: label(index),
                secret: credential.secret().clone(),
            };
            debug!(
                key = %selected.label,
                request_count = credential.request_count(),
                "key selected"
            );
            pool.set_cursor(index + 1);
            metrics::counter!("key_pool_selections_total", "result" => "selected").increment(1);
            return Ok(selected);
        }

        let message = exhausted_message(&pool, &self.policy);
        warn!(keys = n, "all keys at or above warning threshold");
        metrics::counter!("key_pool_selections_total", "result" => "exhausted").increment(1);
        metrics::gauge!("key_pool_eligible_keys").set(0.0);
        Err(Error::Exhausted(message))
    }

    /// Count one successful upstream request against the key at `index`.
    pub async fn record_use(&self, index: usize) {
        let now = Instant::now();
        let mut pool = self.pool.lock().await;
        pool.record_use(index, now);
        let count = pool
            .get(index)
            .map(|c| c.request_count())
            .unwrap_or_default();
        if count == self.policy.warning_threshold {
            info!(
                key = %label(index),
                request_count = count,
                "key reached warning threshold, retiring until reset"
            );
        } else {
            debug!(key = %label(index), request_count = count, "key usage recorded");
        }
        metrics::gauge!("key_pool_eligible_keys").set(eligible_count(&pool, &self.policy) as f64);
    }

    /// Retire a key after the upstream reported its quota as exhausted.
    pub async fn mark_exhausted(&self, index: usize) {
        let now = Instant::now();
        let mut pool = self.pool.lock().await;
        pool.raise_usage(index, self.policy.daily_limit, now);
        warn!(key = %label(index), "upstream reported quota exhausted, retiring key");
        metrics::gauge!("key_pool_eligible_keys").set(eligible_count(&pool, &self.policy) as f64);
    }

    /// Apply the age-based reset outside of selection. Returns how many keys reset.
    pub async fn reset_stale(&self) -> usize {
        let now = Instant::now();
        let mut pool = self.pool.lock().await;
        let reset = reset_stale_locked(&mut pool, &self.policy, now);
        metrics::gauge!("key_pool_eligible_keys").set(eligible_count(&pool, &self.policy) as f64);
        reset
    }

    /// Pool summary for the health endpoint. Never includes key material.
    ///
    /// All keys eligible → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let now = Instant::now();
        let pool = self.pool.lock().await;

        let mut keys = Vec::with_capacity(pool.len());
        let mut eligible = 0usize;
        for (index, credential) in pool.iter().enumerate() {
            let is_eligible = self.is_eligible_at(credential, now);
            if is_eligible {
                eligible += 1;
            }
            keys.push(serde_json::json!({
                "label": label(index),
                "request_count": credential.request_count(),
                "eligible": is_eligible,
                "last_used_secs_ago": credential
                    .last_used()
                    .map(|t| now.duration_since(t).as_secs()),
            }));
        }

        let total = pool.len();
        let status = if eligible == total {
            "healthy"
        } else if eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_eligible": eligible,
            "warning_threshold": self.policy.warning_threshold,
            "next_index": pool.cursor(),
            "keys": keys,
        })
    }

    /// Eligibility as `select` would judge it at `now`, counting a pending reset.
    fn is_eligible_at(&self, credential: &crate::pool::Credential, now: Instant) -> bool {
        is_stale(credential, &self.policy, now)
            || credential.request_count() < self.policy.warning_threshold
    }
}

fn is_stale(credential: &crate::pool::Credential, policy: &QuotaPolicy, now: Instant) -> bool {
    credential
        .last_used()
        .is_some_and(|t| now.duration_since(t) > policy.reset_after)
}

fn reset_stale_locked(pool: &mut CredentialPool, policy: &QuotaPolicy, now: Instant) -> usize {
    let stale: Vec<usize> = pool
        .iter()
        .enumerate()
        .filter(|(_, c)| c.request_count() > 0 && is_stale(c, policy, now))
        .map(|(i, _)| i)
        .collect();
    for &index in &stale {
        pool.reset_usage(index);
        info!(key = %label(index), "key idle past reset window, usage reset");
    }
    stale.len()
}

fn eligible_count(pool: &CredentialPool, policy: &QuotaPolicy) -> usize {
    pool.iter()
        .filter(|c| c.request_count() < policy.warning_threshold)
        .count()
}

fn exhausted_message(pool: &CredentialPool, policy: &QuotaPolicy) -> String {
    serde_json::json!({
        "error": {
            "type": "keys_exhausted",
            "message": "All API keys are at their daily quota",
            "pool": {
                "keys_total": pool.len(),
                "keys_eligible": eligible_count(pool, policy),
            }
        }
    })
    .to_string()
}
