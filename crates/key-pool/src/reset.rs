//! Background sweep for the age-based usage reset
//!
//! `select` already resets stale counters before scanning, so this task is
//! only needed to keep the health endpoint and the eligible-keys gauge
//! accurate while no traffic arrives.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::rotation::RotationManager;

/// Spawn a task that calls `reset_stale` every `interval`.
pub fn spawn_reset_task(
    manager: Arc<RotationManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing has been used yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reset = manager.reset_stale().await;
            debug!(reset, "key usage sweep complete");
        }
    })
}
