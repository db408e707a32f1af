//! Opaque bearer token lifecycle.
//!
//! Tokens are 32 random bytes, base64url-encoded for the wire; only the
//! SHA-256 hash is persisted. Session tokens are unique per (account, device
//! label). Pending-2FA tokens are a short-lived sub-kind carrying only the
//! `2fa-verify` ability and are consumed exactly once, whatever the outcome
//! of the verification they gate.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AuthError, AuthResult};
use crate::store::{TokenKind, TokenRecord, TokenStore};

const TOKEN_BYTES: usize = 32;

/// The only ability a pending-2FA token carries.
pub const PENDING_2FA_ABILITY: &str = "2fa-verify";
pub const PENDING_2FA_LABEL: &str = "2fa-pending";
pub const PENDING_2FA_TTL_MINUTES: i64 = 10;

/// Generate an opaque token secret.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token bytes")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token secret for storage or lookup.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

#[derive(Clone)]
pub struct TokenIssuer {
    tokens: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenStore>, clock: Arc<dyn Clock>) -> Self {
        Self { tokens, clock }
    }

    /// Issue a session token for a device label. Any prior session token with
    /// the same label is revoked atomically.
    pub async fn issue_session(
        &self,
        account_id: Uuid,
        label: &str,
        abilities: Vec<String>,
        ttl: Option<Duration>,
    ) -> AuthResult<(String, TokenRecord)> {
        let now = self.clock.now();
        let secret = generate_token()?;
        let record = TokenRecord {
            id: Uuid::new_v4(),
            account_id,
            kind: TokenKind::Session,
            label: label.to_string(),
            abilities,
            token_hash: hash_token(&secret),
            expires_at: ttl.map(|ttl| now + ttl),
            created_at: now,
        };
        self.tokens.issue(record.clone()).await?;
        Ok((secret, record))
    }

    /// Issue the short-lived token that bridges password check and 2FA code
    /// entry. It can do nothing except verify a second factor.
    pub async fn issue_pending_two_factor(&self, account_id: Uuid) -> AuthResult<String> {
        let now = self.clock.now();
        let secret = generate_token()?;
        let record = TokenRecord {
            id: Uuid::new_v4(),
            account_id,
            kind: TokenKind::PendingTwoFactor,
            label: PENDING_2FA_LABEL.to_string(),
            abilities: vec![PENDING_2FA_ABILITY.to_string()],
            token_hash: hash_token(&secret),
            expires_at: Some(now + Duration::minutes(PENDING_2FA_TTL_MINUTES)),
            created_at: now,
        };
        self.tokens.issue(record).await?;
        Ok(secret)
    }

    /// Resolve a presented secret to its live record. Expired rows are
    /// deleted on sight.
    pub async fn authenticate(&self, secret: &str) -> AuthResult<TokenRecord> {
        let record = self
            .tokens
            .find_by_hash(&hash_token(secret))
            .await?
            .ok_or_else(unauthenticated)?;
        if record.is_expired(self.clock.now()) {
            self.tokens.delete_by_id(record.id).await?;
            return Err(unauthenticated());
        }
        Ok(record)
    }

    /// `authenticate` plus an ability requirement.
    pub async fn authenticate_with_ability(
        &self,
        secret: &str,
        ability: &str,
    ) -> AuthResult<TokenRecord> {
        let record = self.authenticate(secret).await?;
        if !record.can(ability) {
            return Err(AuthError::Forbidden(
                "Token does not grant this action".to_string(),
            ));
        }
        Ok(record)
    }

    /// Consume a pending-2FA token. The row is deleted as soon as it is
    /// found, before any checks, so a secret can never be replayed across
    /// verification attempts.
    pub async fn consume_pending(&self, secret: &str) -> AuthResult<TokenRecord> {
        let record = self
            .tokens
            .find_by_hash(&hash_token(secret))
            .await?
            .ok_or_else(unauthenticated)?;
        self.tokens.delete_by_id(record.id).await?;

        if record.kind != TokenKind::PendingTwoFactor || !record.can(PENDING_2FA_ABILITY) {
            return Err(unauthenticated());
        }
        if record.is_expired(self.clock.now()) {
            return Err(AuthError::Authentication(
                "Two-factor session expired. Please login again.".to_string(),
            ));
        }
        Ok(record)
    }

    pub async fn revoke(&self, token_id: Uuid) -> AuthResult<()> {
        Ok(self.tokens.delete_by_id(token_id).await?)
    }

    /// Revoke every token the account holds. Returns how many were revoked.
    pub async fn revoke_all(&self, account_id: Uuid) -> AuthResult<u64> {
        Ok(self.tokens.delete_all_for_account(account_id).await?)
    }

    /// Revoke every token except the one in hand (logout other devices).
    pub async fn revoke_others(&self, account_id: Uuid, keep: Uuid) -> AuthResult<u64> {
        Ok(self.tokens.delete_all_except(account_id, keep).await?)
    }

    pub async fn purge_expired(&self) -> AuthResult<u64> {
        Ok(self.tokens.purge_expired(self.clock.now()).await?)
    }
}

fn unauthenticated() -> AuthError {
    AuthError::Authentication("Invalid or expired token".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn issuer() -> (Arc<ManualClock>, TokenIssuer) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        (clock.clone(), TokenIssuer::new(store, clock))
    }

    #[test]
    fn generated_tokens_are_urlsafe_and_distinct() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), TOKEN_BYTES);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[tokio::test]
    async fn issue_and_authenticate_roundtrip() {
        let (_clock, issuer) = issuer();
        let account_id = Uuid::new_v4();
        let (secret, record) = issuer
            .issue_session(account_id, "web", vec!["posts.view".to_string()], None)
            .await
            .unwrap();

        let found = issuer.authenticate(&secret).await.unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.account_id, account_id);
        assert!(found.can("posts.view"));

        assert!(issuer.authenticate("bogus").await.is_err());
    }

    #[tokio::test]
    async fn reissuing_a_device_label_revokes_the_prior_secret() {
        let (_clock, issuer) = issuer();
        let account_id = Uuid::new_v4();
        let (first, _) = issuer
            .issue_session(account_id, "phone", vec![], None)
            .await
            .unwrap();
        let (second, _) = issuer
            .issue_session(account_id, "phone", vec![], None)
            .await
            .unwrap();

        assert!(issuer.authenticate(&first).await.is_err());
        assert!(issuer.authenticate(&second).await.is_ok());
    }

    #[tokio::test]
    async fn expired_session_tokens_stop_authenticating() {
        let (clock, issuer) = issuer();
        let (secret, _) = issuer
            .issue_session(Uuid::new_v4(), "web", vec![], Some(Duration::hours(1)))
            .await
            .unwrap();
        assert!(issuer.authenticate(&secret).await.is_ok());

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        assert!(issuer.authenticate(&secret).await.is_err());
        // The expired row was dropped, not just rejected.
        assert_eq!(issuer.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_token_is_single_use_even_on_failure_paths() {
        let (_clock, issuer) = issuer();
        let secret = issuer
            .issue_pending_two_factor(Uuid::new_v4())
            .await
            .unwrap();

        let record = issuer.consume_pending(&secret).await.unwrap();
        assert_eq!(record.kind, TokenKind::PendingTwoFactor);
        assert!(record.can(PENDING_2FA_ABILITY));

        // A second presentation of the same secret fails.
        assert!(issuer.consume_pending(&secret).await.is_err());
    }

    #[tokio::test]
    async fn expired_pending_token_is_consumed_and_rejected() {
        let (clock, issuer) = issuer();
        let secret = issuer
            .issue_pending_two_factor(Uuid::new_v4())
            .await
            .unwrap();
        clock.advance(Duration::minutes(PENDING_2FA_TTL_MINUTES) + Duration::seconds(1));

        let err = issuer.consume_pending(&secret).await.unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
        assert!(issuer.consume_pending(&secret).await.is_err());
    }

    #[tokio::test]
    async fn session_tokens_cannot_pass_as_pending() {
        let (_clock, issuer) = issuer();
        let (secret, _) = issuer
            .issue_session(Uuid::new_v4(), "web", vec!["*".to_string()], None)
            .await
            .unwrap();
        assert!(issuer.consume_pending(&secret).await.is_err());
    }

    #[tokio::test]
    async fn ability_gate_rejects_unscoped_tokens() {
        let (_clock, issuer) = issuer();
        let (secret, _) = issuer
            .issue_session(Uuid::new_v4(), "web", vec!["posts.view".to_string()], None)
            .await
            .unwrap();
        assert!(
            issuer
                .authenticate_with_ability(&secret, "posts.view")
                .await
                .is_ok()
        );
        assert!(matches!(
            issuer
                .authenticate_with_ability(&secret, "users.delete")
                .await,
            Err(AuthError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn revoke_others_keeps_the_named_token() {
        let (_clock, issuer) = issuer();
        let account_id = Uuid::new_v4();
        let (web, web_record) = issuer
            .issue_session(account_id, "web", vec![], None)
            .await
            .unwrap();
        let (phone, _) = issuer
            .issue_session(account_id, "phone", vec![], None)
            .await
            .unwrap();

        let revoked = issuer.revoke_others(account_id, web_record.id).await.unwrap();
        assert_eq!(revoked, 1);
        assert!(issuer.authenticate(&web).await.is_ok());
        assert!(issuer.authenticate(&phone).await.is_err());
    }
}
