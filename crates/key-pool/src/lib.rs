//! Quota-aware rotation over a pool of upstream API keys
//!
//! Every key carries a request counter and a last-used instant. Selection scans
//! the pool round-robin from a cursor and skips keys whose counter has reached
//! the warning threshold, which sits below the provider's daily limit to leave
//! headroom. Counters reset once a key has gone unused for longer than the
//! reset window (24h by default).
//!
//! Key lifecycle:
//! 1. Keys are loaded once at startup; an empty list is a fatal config error
//! 2. `select` picks the next eligible key and advances the cursor past it
//! 3. The caller forwards the request; on a non-error upstream status it calls
//!    `record_use`, failed calls never count against quota
//! 4. A 429 quota response retires the key via `mark_exhausted`
//! 5. After the reset window the counter drops back to zero
//!
//! State is process-local and is lost on restart.

pub mod error;
pub mod pool;
pub mod quota;
pub mod reset;
pub mod rotation;

pub use error::{Error, Result};
pub use pool::{Credential, CredentialPool};
pub use quota::classify_status;
pub use reset::spawn_reset_task;
pub use rotation::{QuotaPolicy, RotationManager, SelectedCredential};
