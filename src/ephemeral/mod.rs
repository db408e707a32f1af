//! One-time email tokens: address verification and password reset.
//!
//! Both flows share one shape: a send replaces any live token for the owner,
//! a consume deletes every token the owner has. Sends are refused inside a
//! 60-second cooldown, independent of any request-level throttle. Notifier
//! failures are logged, never surfaced; the token is live either way.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::password;
use crate::clock::Clock;
use crate::error::{AuthError, AuthResult};
use crate::notify::{EmailTemplate, Notifier};
use crate::store::{
    AccountRecord, AccountStore, AuditEvent, AuditStore, EphemeralKind, EphemeralTokenRecord,
    EphemeralTokenStore,
};
use crate::tokens::{self, TokenIssuer};

pub const EMAIL_VERIFY_TTL_HOURS: i64 = 24;
pub const PASSWORD_RESET_TTL_MINUTES: i64 = 60;
pub const RESEND_COOLDOWN_SECONDS: i64 = 60;

/// Seconds the caller must wait before another send, or `None` if the
/// cooldown has passed.
async fn cooldown_remaining(
    store: &Arc<dyn EphemeralTokenStore>,
    clock: &Arc<dyn Clock>,
    kind: EphemeralKind,
    owner_email: &str,
) -> AuthResult<Option<i64>> {
    let Some(latest) = store.latest_created_for_owner(kind, owner_email).await? else {
        return Ok(None);
    };
    let elapsed = (clock.now() - latest).num_seconds();
    if elapsed < RESEND_COOLDOWN_SECONDS {
        return Ok(Some(RESEND_COOLDOWN_SECONDS - elapsed));
    }
    Ok(None)
}

async fn issue(
    store: &Arc<dyn EphemeralTokenStore>,
    clock: &Arc<dyn Clock>,
    kind: EphemeralKind,
    owner_email: &str,
    ttl: Duration,
) -> AuthResult<String> {
    let now = clock.now();
    let secret = tokens::generate_token()?;
    store
        .replace_for_owner(EphemeralTokenRecord {
            id: Uuid::new_v4(),
            kind,
            owner_email: owner_email.to_string(),
            token_hash: tokens::hash_token(&secret),
            expires_at: now + ttl,
            created_at: now,
        })
        .await?;
    Ok(secret)
}

async fn lookup(
    store: &Arc<dyn EphemeralTokenStore>,
    clock: &Arc<dyn Clock>,
    kind: EphemeralKind,
    secret: &str,
    expired_message: &str,
    missing_message: &str,
) -> AuthResult<EphemeralTokenRecord> {
    let record = store
        .find_by_hash(kind, &tokens::hash_token(secret))
        .await?
        .ok_or_else(|| AuthError::NotFound(missing_message.to_string()))?;
    if record.expires_at <= clock.now() {
        return Err(AuthError::Validation(expired_message.to_string()));
    }
    Ok(record)
}

#[derive(Clone)]
pub struct EmailVerificationService {
    tokens: Arc<dyn EphemeralTokenStore>,
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    frontend_base_url: String,
}

impl EmailVerificationService {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn EphemeralTokenStore>,
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        frontend_base_url: String,
    ) -> Self {
        Self {
            tokens,
            accounts,
            notifier,
            audit,
            clock,
            frontend_base_url,
        }
    }

    /// Send (or resend) a verification link. Silently succeeds for unknown
    /// addresses so the endpoint cannot be used to probe accounts.
    pub async fn send(&self, email: &str) -> AuthResult<()> {
        let email = email.to_lowercase();
        let Some(account) = self.accounts.find_by_email(&email).await? else {
            return Ok(());
        };
        if account.email_verified() {
            return Err(AuthError::Validation(
                "Email address is already verified".to_string(),
            ));
        }
        if let Some(retry) = cooldown_remaining(
            &self.tokens,
            &self.clock,
            EphemeralKind::EmailVerify,
            &email,
        )
        .await?
        {
            return Err(AuthError::RateLimited {
                retry_after_seconds: retry,
            });
        }

        let secret = issue(
            &self.tokens,
            &self.clock,
            EphemeralKind::EmailVerify,
            &email,
            Duration::hours(EMAIL_VERIFY_TTL_HOURS),
        )
        .await?;

        let verify_url = format!("{}/verify-email?token={secret}", self.frontend_base_url);
        let payload = json!({ "name": account.name, "verify_url": verify_url });
        if let Err(err) = self
            .notifier
            .send_email(&email, EmailTemplate::VerifyEmail, &payload)
        {
            warn!(error = %err, "verification email dispatch failed");
        }
        Ok(())
    }

    /// Check a presented token without consuming it.
    pub async fn validate(&self, secret: &str) -> AuthResult<EphemeralTokenRecord> {
        lookup(
            &self.tokens,
            &self.clock,
            EphemeralKind::EmailVerify,
            secret,
            "Verification link has expired",
            "Invalid verification link",
        )
        .await
    }

    /// Mark the owner verified and burn every token they hold.
    pub async fn consume(&self, secret: &str) -> AuthResult<AccountRecord> {
        let record = self.validate(secret).await?;
        let account = self
            .accounts
            .find_by_email(&record.owner_email)
            .await?
            .ok_or_else(|| AuthError::NotFound("Invalid verification link".to_string()))?;
        self.accounts
            .mark_email_verified(account.id, self.clock.now())
            .await?;
        self.tokens
            .delete_all_for_owner(EphemeralKind::EmailVerify, &record.owner_email)
            .await?;
        if let Err(err) = self
            .audit
            .record(AuditEvent::new(
                "email_verified",
                json!({ "account_id": account.id }),
                self.clock.now(),
            ))
            .await
        {
            warn!(error = %err, "failed to record security event");
        }
        self.accounts
            .find_by_id(account.id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Invalid verification link".to_string()))
    }
}

#[derive(Clone)]
pub struct PasswordResetService {
    tokens: Arc<dyn EphemeralTokenStore>,
    accounts: Arc<dyn AccountStore>,
    sessions: TokenIssuer,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    frontend_base_url: String,
}

impl PasswordResetService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        tokens: Arc<dyn EphemeralTokenStore>,
        accounts: Arc<dyn AccountStore>,
        sessions: TokenIssuer,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        frontend_base_url: String,
    ) -> Self {
        Self {
            tokens,
            accounts,
            sessions,
            notifier,
            audit,
            clock,
            frontend_base_url,
        }
    }

    /// Send a reset link. Unknown addresses succeed silently.
    pub async fn request(&self, email: &str) -> AuthResult<()> {
        let email = email.to_lowercase();
        let Some(account) = self.accounts.find_by_email(&email).await? else {
            return Ok(());
        };
        if let Some(retry) = cooldown_remaining(
            &self.tokens,
            &self.clock,
            EphemeralKind::PasswordReset,
            &email,
        )
        .await?
        {
            return Err(AuthError::RateLimited {
                retry_after_seconds: retry,
            });
        }

        let secret = issue(
            &self.tokens,
            &self.clock,
            EphemeralKind::PasswordReset,
            &email,
            Duration::minutes(PASSWORD_RESET_TTL_MINUTES),
        )
        .await?;

        let reset_url = format!("{}/reset-password?token={secret}", self.frontend_base_url);
        let payload = json!({ "name": account.name, "reset_url": reset_url });
        if let Err(err) = self
            .notifier
            .send_email(&email, EmailTemplate::ResetPassword, &payload)
        {
            warn!(error = %err, "reset email dispatch failed");
        }
        Ok(())
    }

    pub async fn validate(&self, secret: &str) -> AuthResult<EphemeralTokenRecord> {
        lookup(
            &self.tokens,
            &self.clock,
            EphemeralKind::PasswordReset,
            secret,
            "Reset link has expired",
            "Invalid reset link",
        )
        .await
    }

    /// Set the new password, burn the owner's reset tokens, and revoke every
    /// session so the reset takes effect on all devices at once.
    pub async fn reset(&self, secret: &str, new_password: &str) -> AuthResult<()> {
        let record = self.validate(secret).await?;
        if let Some(message) = password::password_policy_error(new_password) {
            return Err(AuthError::Validation(message));
        }
        let account = self
            .accounts
            .find_by_email(&record.owner_email)
            .await?
            .ok_or_else(|| AuthError::NotFound("Invalid reset link".to_string()))?;

        let hash = password::hash_password(new_password)?;
        self.accounts.set_password_hash(account.id, &hash).await?;
        self.tokens
            .delete_all_for_owner(EphemeralKind::PasswordReset, &record.owner_email)
            .await?;
        self.sessions.revoke_all(account.id).await?;

        if let Err(err) = self
            .audit
            .record(AuditEvent::new(
                "password_reset",
                json!({ "account_id": account.id }),
                self.clock.now(),
            ))
            .await
        {
            warn!(error = %err, "failed to record security event");
        }
        Ok(())
    }
}
