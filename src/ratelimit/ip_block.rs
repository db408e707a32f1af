//! Address-level blocking with automatic escalation.
//!
//! Every failed login feeds a per-address suspicion counter; once it crosses
//! the threshold inside its window, the address is blocked outright and a
//! security event is recorded. The block gate runs before any business logic
//! so a blocked caller only ever sees 429.

use anyhow::Result;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::store::{AuditEvent, AuditStore, BlockedIpEntry, BlockedIpStore, CounterStore};

/// Failures per address inside one window before an automatic block.
pub const SUSPICIOUS_THRESHOLD: u64 = 20;
/// Suspicion counter window.
pub const SUSPICIOUS_WINDOW_SECONDS: i64 = 3600;
/// Automatic block duration.
pub const AUTO_BLOCK_MINUTES: i64 = 120;

const AUTO_BLOCK_REASON: &str = "Too many failed login attempts";

fn suspicion_key(ip: &str) -> String {
    super::action_key("security", "suspicious", ip)
}

#[derive(Clone)]
pub struct IpBlocklist {
    blocks: Arc<dyn BlockedIpStore>,
    counters: Arc<dyn CounterStore>,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl IpBlocklist {
    #[must_use]
    pub fn new(
        blocks: Arc<dyn BlockedIpStore>,
        counters: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blocks,
            counters,
            audit,
            clock,
        }
    }

    /// Active block for the address, if any.
    pub async fn info(&self, ip: &str) -> Result<Option<BlockedIpEntry>> {
        self.blocks.get(ip).await
    }

    pub async fn is_blocked(&self, ip: &str) -> Result<bool> {
        Ok(self.blocks.get(ip).await?.is_some())
    }

    /// Block the address for `minutes`. Re-blocking refreshes the window.
    pub async fn block(&self, ip: &str, minutes: i64, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let entry = BlockedIpEntry {
            blocked_at: now,
            blocked_until: now + Duration::minutes(minutes),
            reason: reason.to_string(),
        };
        self.blocks.put(ip, entry).await?;
        warn!(ip = %ip, minutes, reason, "address blocked");
        self.audit
            .record(AuditEvent::new(
                "ip_blocked",
                json!({ "ip": ip, "minutes": minutes, "reason": reason }),
                now,
            ))
            .await?;
        Ok(())
    }

    /// Remove any block and forget accumulated suspicion. A no-op for an
    /// address that is not blocked.
    pub async fn unblock(&self, ip: &str) -> Result<()> {
        self.blocks.delete(ip).await?;
        self.counters.clear(&suspicion_key(ip)).await?;
        self.audit
            .record(AuditEvent::new(
                "ip_unblocked",
                json!({ "ip": ip }),
                self.clock.now(),
            ))
            .await?;
        Ok(())
    }

    /// Count one failed attempt from the address; block it once the count
    /// crosses the threshold. Returns whether a block was applied.
    pub async fn record_failure(&self, ip: &str) -> Result<bool> {
        let count = self
            .counters
            .incr(&suspicion_key(ip), SUSPICIOUS_WINDOW_SECONDS)
            .await?;
        if count >= SUSPICIOUS_THRESHOLD {
            self.block(ip, AUTO_BLOCK_MINUTES, AUTO_BLOCK_REASON).await?;
            self.counters.clear(&suspicion_key(ip)).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryAuditStore, MemoryBlockedIpStore, MemoryCounterStore};
    use chrono::Utc;

    fn blocklist() -> (Arc<ManualClock>, Arc<MemoryAuditStore>, IpBlocklist) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let audit = Arc::new(MemoryAuditStore::new());
        let blocklist = IpBlocklist::new(
            Arc::new(MemoryBlockedIpStore::new(clock.clone())),
            Arc::new(MemoryCounterStore::new(clock.clone())),
            audit.clone(),
            clock.clone(),
        );
        (clock, audit, blocklist)
    }

    #[tokio::test]
    async fn manual_block_and_unblock() {
        let (_clock, audit, blocklist) = blocklist();
        assert!(!blocklist.is_blocked("10.0.0.9").await.unwrap());

        blocklist.block("10.0.0.9", 60, "abuse report").await.unwrap();
        assert!(blocklist.is_blocked("10.0.0.9").await.unwrap());
        let info = blocklist.info("10.0.0.9").await.unwrap().unwrap();
        assert_eq!(info.reason, "abuse report");

        blocklist.unblock("10.0.0.9").await.unwrap();
        assert!(!blocklist.is_blocked("10.0.0.9").await.unwrap());

        let kinds: Vec<String> = audit
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec!["ip_unblocked", "ip_blocked"]);
    }

    #[tokio::test]
    async fn unblock_is_a_noop_for_unknown_address() {
        let (_clock, _audit, blocklist) = blocklist();
        assert!(blocklist.unblock("192.0.2.1").await.is_ok());
    }

    #[tokio::test]
    async fn twentieth_failure_blocks_for_two_hours() {
        let (clock, _audit, blocklist) = blocklist();
        for _ in 0..19 {
            assert!(!blocklist.record_failure("10.0.0.9").await.unwrap());
        }
        assert!(!blocklist.is_blocked("10.0.0.9").await.unwrap());

        assert!(blocklist.record_failure("10.0.0.9").await.unwrap());
        assert!(blocklist.is_blocked("10.0.0.9").await.unwrap());
        let info = blocklist.info("10.0.0.9").await.unwrap().unwrap();
        assert_eq!(info.blocked_until - info.blocked_at, Duration::minutes(120));

        clock.advance(Duration::minutes(121));
        assert!(!blocklist.is_blocked("10.0.0.9").await.unwrap());
    }

    #[tokio::test]
    async fn suspicion_decays_between_windows() {
        let (clock, _audit, blocklist) = blocklist();
        for _ in 0..19 {
            blocklist.record_failure("10.0.0.9").await.unwrap();
        }
        clock.advance(Duration::seconds(SUSPICIOUS_WINDOW_SECONDS + 1));
        // Window decayed, so this failure starts a fresh count.
        assert!(!blocklist.record_failure("10.0.0.9").await.unwrap());
        assert!(!blocklist.is_blocked("10.0.0.9").await.unwrap());
    }
}
