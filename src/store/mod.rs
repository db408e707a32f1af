//! Persistence gateways for the engine.
//!
//! Each trait is an abstract store boundary; backends supply their own
//! atomicity. Operations that must span multiple writes (registration =
//! account + default role, token issue = revoke prior + insert) are single
//! methods so a backend can wrap them in one transaction.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryAuditStore, MemoryBlockedIpStore, MemoryCounterStore, MemoryStore};
pub use postgres::PgStore;

/// Persisted user record. Secret fields hold ciphertext, never plaintext.
#[derive(Clone, Debug)]
pub struct AccountRecord {
    pub id: Uuid,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub two_factor_enabled: bool,
    pub two_factor_secret: Option<Vec<u8>>,
    pub two_factor_recovery_codes: Option<Vec<u8>>,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
    pub provider_token: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl AccountRecord {
    /// Whether the account is currently locked out.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    #[must_use]
    pub fn email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}

/// Fields needed to create an account.
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
    pub provider_token: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub category: String,
}

/// Outcome of an insert that can hit a uniqueness constraint.
#[derive(Debug)]
pub enum InsertOutcome<T> {
    Inserted(T),
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Session,
    PendingTwoFactor,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::PendingTwoFactor => "pending_2fa",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "pending_2fa" {
            Self::PendingTwoFactor
        } else {
            Self::Session
        }
    }
}

/// Bearer token row. Only the SHA-256 hash of the opaque secret is stored.
#[derive(Clone, Debug)]
pub struct TokenRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: TokenKind,
    pub label: String,
    pub abilities: Vec<String>,
    pub token_hash: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn can(&self, ability: &str) -> bool {
        self.abilities.iter().any(|a| a == "*" || a == ability)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EphemeralKind {
    EmailVerify,
    PasswordReset,
}

impl EphemeralKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerify => "email_verify",
            Self::PasswordReset => "password_reset",
        }
    }
}

/// Single-use, time-boxed token keyed by the owning email address.
#[derive(Clone, Debug)]
pub struct EphemeralTokenRecord {
    pub id: Uuid,
    pub kind: EphemeralKind,
    pub owner_email: String,
    pub token_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct BlockedIpEntry {
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
    pub reason: String,
}

/// Security event recorded independently of the response returned.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: &str, payload: Value, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            payload,
            recorded_at,
        }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create the account and attach the default role as one unit.
    /// Returns `Conflict` when the email or username is already taken.
    async fn create_account(
        &self,
        new: NewAccount,
        default_role_slug: &str,
    ) -> Result<InsertOutcome<AccountRecord>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<AccountRecord>>;
    async fn find_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<AccountRecord>>;

    /// Atomically increment the failed-login counter; when the new count
    /// reaches `threshold`, set `locked_until` to `lock_until` in the same
    /// write. Returns the new count.
    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<u32>;

    /// Reset the failure counter and clear any lockout.
    async fn reset_login_failures(&self, id: Uuid) -> Result<()>;

    async fn record_login(&self, id: Uuid, ip: &str, at: DateTime<Utc>) -> Result<()>;
    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()>;
    async fn set_active(&self, id: Uuid, active: bool) -> Result<()>;
    async fn mark_email_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Store a freshly provisioned (not yet confirmed) second factor.
    async fn set_two_factor_setup(&self, id: Uuid, secret: &[u8], recovery: &[u8]) -> Result<()>;
    async fn set_two_factor_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;
    async fn set_recovery_codes(&self, id: Uuid, recovery: &[u8]) -> Result<()>;
    /// Clear the enabled flag, secret, and recovery codes in one write.
    async fn clear_two_factor(&self, id: Uuid) -> Result<()>;

    async fn link_provider(
        &self,
        id: Uuid,
        provider: &str,
        provider_id: &str,
        provider_token: Option<&[u8]>,
    ) -> Result<()>;
    async fn unlink_provider(&self, id: Uuid) -> Result<()>;

    /// Admin operation: clear an active lockout and failure counter.
    async fn clear_lock(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn list_roles(&self) -> Result<Vec<RoleRecord>>;
    async fn find_role_by_id(&self, id: Uuid) -> Result<Option<RoleRecord>>;
    async fn find_role_by_slug(&self, slug: &str) -> Result<Option<RoleRecord>>;
    async fn create_role(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<InsertOutcome<RoleRecord>>;
    async fn update_role(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<RoleRecord>>;
    async fn delete_role(&self, id: Uuid) -> Result<bool>;

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<PermissionRecord>>;
    async fn set_role_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> Result<()>;

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>>;
    async fn find_permission_by_id(&self, id: Uuid) -> Result<Option<PermissionRecord>>;
    async fn find_permissions_by_slugs(&self, slugs: &[String]) -> Result<Vec<PermissionRecord>>;
    async fn create_permission(
        &self,
        slug: &str,
        name: &str,
        category: &str,
    ) -> Result<InsertOutcome<PermissionRecord>>;
    async fn update_permission(
        &self,
        id: Uuid,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<PermissionRecord>>;
    async fn delete_permission(&self, id: Uuid) -> Result<bool>;

    async fn roles_of(&self, account_id: Uuid) -> Result<Vec<RoleRecord>>;
    /// Idempotent attach.
    async fn assign_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()>;
    async fn remove_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()>;
    async fn sync_roles(&self, account_id: Uuid, role_ids: &[Uuid]) -> Result<()>;

    async fn direct_permissions_of(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>>;
    /// Idempotent attach (sync-without-detach semantics).
    async fn grant_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()>;
    async fn revoke_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()>;
    async fn sync_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()>;

    /// Union of role permissions and direct grants, deduplicated by id.
    async fn effective_permissions(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert the token. For session tokens, any prior token with the same
    /// (account, label) is revoked in the same transaction, before the new
    /// one becomes visible.
    async fn issue(&self, record: TokenRecord) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<TokenRecord>>;
    async fn delete_by_id(&self, id: Uuid) -> Result<()>;
    async fn delete_all_for_account(&self, account_id: Uuid) -> Result<u64>;
    /// Revoke every token of the account except `keep` (logout-others).
    async fn delete_all_except(&self, account_id: Uuid, keep: Uuid) -> Result<u64>;
    /// Drop expired rows; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait EphemeralTokenStore: Send + Sync {
    /// Insert a token after deleting all existing tokens of the same kind
    /// for the owner (single active token per owner).
    async fn replace_for_owner(&self, record: EphemeralTokenRecord) -> Result<()>;

    async fn find_by_hash(
        &self,
        kind: EphemeralKind,
        token_hash: &[u8],
    ) -> Result<Option<EphemeralTokenRecord>>;
    /// Creation time of the newest token for the owner, for resend cooldown.
    async fn latest_created_for_owner(
        &self,
        kind: EphemeralKind,
        owner_email: &str,
    ) -> Result<Option<DateTime<Utc>>>;
    async fn delete_all_for_owner(&self, kind: EphemeralKind, owner_email: &str) -> Result<u64>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Atomic increment-with-decay counter, keyed by string. Backs the rate
/// limiter and the suspicious-activity counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment and return the new count. A fresh key starts a window of
    /// `ttl_seconds`; hits inside an existing window do not extend it.
    async fn incr(&self, key: &str, ttl_seconds: i64) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<u64>;
    async fn clear(&self, key: &str) -> Result<()>;
    /// Seconds until the window decays, `None` when the key is absent.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<i64>>;
}

#[async_trait]
pub trait BlockedIpStore: Send + Sync {
    /// Store or refresh an entry; it self-expires at `blocked_until`.
    async fn put(&self, ip: &str, entry: BlockedIpEntry) -> Result<()>;
    /// Expired entries are reported as absent.
    async fn get(&self, ip: &str) -> Result<Option<BlockedIpEntry>>;
    async fn delete(&self, ip: &str) -> Result<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
    /// Most recent events, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn token_kind_round_trips() {
        assert_eq!(TokenKind::parse(TokenKind::Session.as_str()), TokenKind::Session);
        assert_eq!(
            TokenKind::parse(TokenKind::PendingTwoFactor.as_str()),
            TokenKind::PendingTwoFactor
        );
    }

    #[test]
    fn token_expiry_and_abilities() {
        let now = Utc::now();
        let record = TokenRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            kind: TokenKind::PendingTwoFactor,
            label: "2fa-pending".to_string(),
            abilities: vec!["2fa-verify".to_string()],
            token_hash: vec![1, 2, 3],
            expires_at: Some(now + Duration::minutes(10)),
            created_at: now,
        };
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::minutes(10)));
        assert!(record.can("2fa-verify"));
        assert!(!record.can("posts.view"));
    }

    #[test]
    fn wildcard_ability_grants_everything() {
        let now = Utc::now();
        let record = TokenRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            kind: TokenKind::Session,
            label: "web".to_string(),
            abilities: vec!["*".to_string()],
            token_hash: vec![],
            expires_at: None,
            created_at: now,
        };
        assert!(record.can("posts.delete"));
        assert!(!record.is_expired(now + Duration::days(365)));
    }

    #[test]
    fn account_lock_state_tracks_clock() {
        let now = Utc::now();
        let record = AccountRecord {
            id: Uuid::new_v4(),
            name: "Alice".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: String::new(),
            avatar_url: None,
            is_active: true,
            email_verified_at: None,
            failed_login_attempts: 5,
            locked_until: Some(now + Duration::minutes(30)),
            last_login_at: None,
            last_login_ip: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            two_factor_recovery_codes: None,
            provider: None,
            provider_id: None,
            provider_token: None,
            created_at: now,
        };
        assert!(record.is_locked(now));
        assert!(!record.is_locked(now + Duration::minutes(31)));
        assert!(!record.email_verified());
    }
}
