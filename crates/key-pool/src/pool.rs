//! Key storage and mutation primitives
//!
//! `CredentialPool` is plain storage: an ordered list of keys and a rotation
//! cursor. Selection policy lives in `RotationManager`, which owns the pool
//! behind a lock.

use common::Secret;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One upstream API key and its usage since the last reset.
#[derive(Debug, Clone)]
pub struct Credential {
    secret: Secret<String>,
    request_count: u32,
    last_used: Option<Instant>,
}

impl Credential {
    fn new(secret: Secret<String>) -> Self {
        Self {
            secret,
            request_count: 0,
            last_used: None,
        }
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// `None` until the key has served its first successful request.
    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }
}

/// Ordered key list plus rotation cursor. Never empty.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: usize,
}

impl CredentialPool {
    /// Build a pool from the configured keys. An empty list is rejected.
    pub fn new(secrets: Vec<Secret<String>>) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::EmptyPool);
        }
        Ok(Self {
            credentials: secrets.into_iter().map(Credential::new).collect(),
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Always false: a pool holds at least one credential.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.credentials.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor. Out-of-range values wrap.
    pub fn set_cursor(&mut self, index: usize) {
        self.cursor = index % self.credentials.len();
    }

    pub fn reset_usage(&mut self, index: usize) {
        if let Some(c) = self.credentials.get_mut(index) {
            c.request_count = 0;
        }
    }

    pub fn record_use(&mut self, index: usize, now: Instant) {
        if let Some(c) = self.credentials.get_mut(index) {
            c.request_count = c.request_count.saturating_add(1);
            c.last_used = Some(now);
        }
    }

    /// Raise the counter to at least `count`. Never lowers it.
    pub fn raise_usage(&mut self, index: usize, count: u32, now: Instant) {
        if let Some(c) = self.credentials.get_mut(index) {
            c.request_count = c.request_count.max(count);
            c.last_used = Some(now);
        }
    }
}

/// Non-secret identifier used in logs, metrics and health output.
pub fn label(index: usize) -> String {
    format!("key-{index}")
}
