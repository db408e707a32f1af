//! Attempt throttling over a decaying counter store.
//!
//! Keys are derived from hashed inputs so raw identifiers and addresses never
//! become storage keys. The login key mixes the lowercased identifier with the
//! client address, which keeps one address from exhausting the budget of an
//! identifier it does not control.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::store::CounterStore;

pub mod ip_block;

pub use ip_block::IpBlocklist;

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Throttle key for a login attempt against one identifier from one address.
#[must_use]
pub fn login_key(identifier: &str, ip: &str) -> String {
    let subject = format!("{}|{ip}", identifier.to_lowercase());
    format!("login_attempts:{}", hex_digest(&subject))
}

/// Throttle key for an arbitrary action, e.g. `("2fa", "verify", token_id)`.
#[must_use]
pub fn action_key(scope: &str, action: &str, subject: &str) -> String {
    format!("{scope}:{action}:{}", hex_digest(subject))
}

/// Fixed-window rate limiter. A window opens on the first hit and decays
/// after its TTL; hits inside a live window do not extend it.
#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    /// Whether the key has already used up `max` attempts in the live window.
    pub async fn too_many_attempts(&self, key: &str, max: u64) -> Result<bool> {
        Ok(self.counters.get(key).await? >= max)
    }

    /// Record an attempt and return the new count.
    pub async fn hit(&self, key: &str, decay_seconds: i64) -> Result<u64> {
        self.counters.incr(key, decay_seconds).await
    }

    pub async fn attempts(&self, key: &str) -> Result<u64> {
        self.counters.get(key).await
    }

    /// Forget the key entirely, e.g. after a successful login.
    pub async fn clear(&self, key: &str) -> Result<()> {
        self.counters.clear(key).await
    }

    /// Seconds until the window decays. `None` when no window is live.
    pub async fn available_in(&self, key: &str) -> Result<Option<i64>> {
        self.counters.ttl_remaining(key).await
    }

    /// Attempts left before `max` is reached, floored at zero.
    pub async fn remaining(&self, key: &str, max: u64) -> Result<u64> {
        Ok(max.saturating_sub(self.counters.get(key).await?))
    }
}
