//! Classification of upstream error responses
//!
//! The Generative Language API answers every rate limit with HTTP 429 and a
//! `RESOURCE_EXHAUSTED` status, whether the per-minute or the per-day quota
//! ran out. Only the per-day quota retires a key until its counter resets, so
//! the body has to name it; per-minute limits clear on their own.

use provider::ErrorClassification;

/// Lowercased body fragments naming the per-day quota, e.g. the quota id
/// `GenerateRequestsPerDayPerProjectPerModel-FreeTier`.
const DAILY_QUOTA_PATTERNS: &[&str] = &["perday", "per day", "per_day", "daily"];

/// Classify an upstream error by HTTP status and response body.
///
/// 429 naming the daily quota → `QuotaExceeded`; 401/403 → `Permanent`
/// (bad or revoked key); anything else, other 429s included, is `Transient`.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => {
            let lower = body.to_lowercase();
            if DAILY_QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
                ErrorClassification::QuotaExceeded
            } else {
                ErrorClassification::Transient
            }
        }
        401 | 403 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}
