//! Login orchestration.
//!
//! Three independent gates guard every credential check: the address-level
//! blocklist, the per-identifier throttle, and the account's own lock state.
//! Each is enforced on its own so disabling one control never silently
//! disables another. Failed attempts feed all of them; success clears only
//! the throttle and the account counter, never an address block.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AuthError, AuthResult, invalid_credentials};
use crate::ratelimit::{self, IpBlocklist, RateLimiter};
use crate::rbac::{DEFAULT_ROLE, RbacService};
use crate::store::{AccountRecord, AccountStore, AuditEvent, AuditStore, InsertOutcome, NewAccount};
use crate::tokens::TokenIssuer;
use crate::totp::TwoFactorService;

pub mod password;
pub mod social;

/// Lockout and throttle policy. Defaults match the shipped behavior: five
/// failures lock for thirty minutes, the login throttle decays after fifteen.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub max_login_attempts: u32,
    pub lockout_minutes: i64,
    pub login_decay_seconds: i64,
    pub session_ttl_hours: Option<i64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            lockout_minutes: 30,
            login_decay_seconds: 900,
            session_ttl_hours: None,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn with_max_login_attempts(mut self, max: u32) -> Self {
        self.max_login_attempts = max;
        self
    }

    #[must_use]
    pub fn with_lockout_minutes(mut self, minutes: i64) -> Self {
        self.lockout_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_login_decay_seconds(mut self, seconds: i64) -> Self {
        self.login_decay_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_hours(mut self, hours: Option<i64>) -> Self {
        self.session_ttl_hours = hours;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RegisterRequest {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

/// An issued session: the plaintext secret plus what it authorizes.
#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
    pub token_id: Uuid,
    pub account: AccountRecord,
    pub abilities: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum LoginOutcome {
    Authenticated(Box<Session>),
    TwoFactorRequired { pending_token: String },
}

/// Whether an identifier should be looked up as an email address.
#[must_use]
pub fn looks_like_email(identifier: &str) -> bool {
    identifier
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
}

fn validate_email(email: &str) -> AuthResult<()> {
    if !looks_like_email(email) || email.chars().any(char::is_whitespace) || email.len() > 255 {
        return Err(AuthError::Validation(
            "A valid email address is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_username(username: &str) -> AuthResult<()> {
    let len = username.chars().count();
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !(3..=32).contains(&len)
        || !valid_chars
        || !username.starts_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(AuthError::Validation(
            "Username must be 3-32 characters of letters, numbers, '.', '-' or '_'".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct AuthService {
    accounts: Arc<dyn AccountStore>,
    rbac: RbacService,
    tokens: TokenIssuer,
    two_factor: TwoFactorService,
    limiter: RateLimiter,
    blocklist: IpBlocklist,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        rbac: RbacService,
        tokens: TokenIssuer,
        two_factor: TwoFactorService,
        limiter: RateLimiter,
        blocklist: IpBlocklist,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        Self {
            accounts,
            rbac,
            tokens,
            two_factor,
            limiter,
            blocklist,
            audit,
            clock,
            config,
        }
    }

    async fn record_event(&self, kind: &str, payload: serde_json::Value) {
        let event = AuditEvent::new(kind, payload, self.clock.now());
        if let Err(err) = self.audit.record(event).await {
            tracing::warn!(kind, error = %err, "failed to record security event");
        }
    }

    /// Reject outright if the caller's address is blocked. Runs before any
    /// business logic.
    pub async fn gate_blocked_ip(&self, ip: &str) -> AuthResult<()> {
        if let Some(entry) = self.blocklist.info(ip).await? {
            let retry = (entry.blocked_until - self.clock.now()).num_seconds().max(1);
            return Err(AuthError::RateLimited {
                retry_after_seconds: retry,
            });
        }
        Ok(())
    }

    pub async fn register(&self, request: RegisterRequest) -> AuthResult<AccountRecord> {
        if request.name.trim().is_empty() {
            return Err(AuthError::Validation("Name is required".to_string()));
        }
        validate_username(&request.username)?;
        validate_email(&request.email)?;
        if let Some(message) = password::password_policy_error(&request.password) {
            return Err(AuthError::Validation(message));
        }

        let new = NewAccount {
            name: request.name.trim().to_string(),
            username: request.username.clone(),
            email: request.email.to_lowercase(),
            password_hash: password::hash_password(&request.password)?,
            avatar_url: None,
            email_verified_at: None,
            provider: None,
            provider_id: None,
            provider_token: None,
            created_at: self.clock.now(),
        };
        match self.accounts.create_account(new, DEFAULT_ROLE).await? {
            InsertOutcome::Inserted(account) => {
                self.record_event("account_registered", json!({ "account_id": account.id }))
                    .await;
                Ok(account)
            }
            InsertOutcome::Conflict => Err(AuthError::Conflict(
                "An account with this email or username already exists".to_string(),
            )),
        }
    }

    /// Credential login. Returns either a ready session or a pending-2FA
    /// token that must be redeemed via [`Self::verify_two_factor`].
    pub async fn login(
        &self,
        identifier: &str,
        presented_password: &str,
        device_label: &str,
        ip: &str,
    ) -> AuthResult<LoginOutcome> {
        self.gate_blocked_ip(ip).await?;

        let key = ratelimit::login_key(identifier, ip);
        let max = u64::from(self.config.max_login_attempts);
        if self.limiter.too_many_attempts(&key, max).await? {
            let retry = self
                .limiter
                .available_in(&key)
                .await?
                .unwrap_or(self.config.login_decay_seconds);
            // Throttled probes still count toward the address-level
            // escalation, so hammering one identifier cannot stay under it.
            self.blocklist.record_failure(ip).await?;
            self.record_event("login_throttled", json!({ "ip": ip })).await;
            return Err(AuthError::RateLimited {
                retry_after_seconds: retry,
            });
        }

        let attempt = self
            .attempt_login(identifier, presented_password, device_label, ip, &key)
            .await;
        if let Err(AuthError::Internal(_)) = &attempt {
            // An internal failure still burns an attempt, so a flapping
            // backend cannot be used to probe credentials for free.
            let _ = self.limiter.hit(&key, self.config.login_decay_seconds).await;
        }
        attempt
    }

    async fn attempt_login(
        &self,
        identifier: &str,
        presented_password: &str,
        device_label: &str,
        ip: &str,
        throttle_key: &str,
    ) -> AuthResult<LoginOutcome> {
        let account = if looks_like_email(identifier) {
            self.accounts.find_by_email(identifier).await?
        } else {
            self.accounts.find_by_username(identifier).await?
        };

        let Some(account) = account else {
            self.register_failure(throttle_key, ip, None).await?;
            return Err(invalid_credentials());
        };

        let now = self.clock.now();
        if account.is_locked(now) {
            let retry = account
                .locked_until
                .map_or(0, |until| (until - now).num_seconds().max(1));
            self.record_event("login_locked", json!({ "account_id": account.id, "ip": ip }))
                .await;
            return Err(AuthError::Locked {
                retry_after_seconds: retry,
            });
        }

        if !account.is_active {
            return Err(AuthError::Forbidden(
                "Your account has been deactivated".to_string(),
            ));
        }

        if !password::verify_password(presented_password, &account.password_hash) {
            let count = self
                .accounts
                .record_failed_login(
                    account.id,
                    self.config.max_login_attempts,
                    now + Duration::minutes(self.config.lockout_minutes),
                )
                .await?;
            self.register_failure(throttle_key, ip, Some(account.id)).await?;
            if count >= self.config.max_login_attempts {
                self.record_event(
                    "account_locked",
                    json!({ "account_id": account.id, "failed_attempts": count }),
                )
                .await;
            }
            return Err(invalid_credentials());
        }

        self.accounts.reset_login_failures(account.id).await?;
        self.limiter.clear(throttle_key).await?;

        if account.two_factor_enabled {
            let pending_token = self.tokens.issue_pending_two_factor(account.id).await?;
            self.record_event("login_pending_2fa", json!({ "account_id": account.id }))
                .await;
            return Ok(LoginOutcome::TwoFactorRequired { pending_token });
        }

        let session = self.finalize_session(account, device_label, ip).await?;
        Ok(LoginOutcome::Authenticated(Box::new(session)))
    }

    async fn register_failure(
        &self,
        throttle_key: &str,
        ip: &str,
        account_id: Option<Uuid>,
    ) -> AuthResult<()> {
        self.limiter
            .hit(throttle_key, self.config.login_decay_seconds)
            .await?;
        self.blocklist.record_failure(ip).await?;
        self.record_event("login_failed", json!({ "account_id": account_id, "ip": ip }))
            .await;
        Ok(())
    }

    /// Redeem a pending-2FA token plus a TOTP or recovery code for a session.
    /// The pending token is gone after this call whatever the outcome.
    pub async fn verify_two_factor(
        &self,
        pending_token: &str,
        code: &str,
        device_label: &str,
        ip: &str,
    ) -> AuthResult<Session> {
        self.gate_blocked_ip(ip).await?;

        let pending = self.tokens.consume_pending(pending_token).await?;
        let account = self
            .accounts
            .find_by_id(pending.account_id)
            .await?
            .ok_or_else(invalid_credentials)?;

        if !self.two_factor.verify(account.id, code).await? {
            self.blocklist.record_failure(ip).await?;
            self.record_event("2fa_failed", json!({ "account_id": account.id, "ip": ip }))
                .await;
            return Err(AuthError::Authentication(
                "Invalid two-factor code".to_string(),
            ));
        }

        self.finalize_session(account, device_label, ip).await
    }

    async fn finalize_session(
        &self,
        account: AccountRecord,
        device_label: &str,
        ip: &str,
    ) -> AuthResult<Session> {
        let now = self.clock.now();
        self.accounts.record_login(account.id, ip, now).await?;

        let abilities = self.rbac.effective_slugs(account.id).await?;
        let ttl = self.config.session_ttl_hours.map(Duration::hours);
        let (token, record) = self
            .tokens
            .issue_session(account.id, device_label, abilities.clone(), ttl)
            .await?;

        self.record_event(
            "login_succeeded",
            json!({ "account_id": account.id, "device": device_label, "ip": ip }),
        )
        .await;

        let mut account = account;
        account.last_login_at = Some(now);
        account.last_login_ip = Some(ip.to_string());
        Ok(Session {
            token,
            token_id: record.id,
            account,
            abilities,
        })
    }

    /// Revoke the presented session.
    pub async fn logout(&self, token_id: Uuid) -> AuthResult<()> {
        self.tokens.revoke(token_id).await
    }

    /// Revoke every session the account holds.
    pub async fn logout_all(&self, account_id: Uuid) -> AuthResult<u64> {
        self.tokens.revoke_all(account_id).await
    }

    /// Change the password after re-authentication; all other sessions are
    /// revoked so a stolen token does not survive the change.
    pub async fn update_password(
        &self,
        account_id: Uuid,
        current_password: &str,
        new_password: &str,
        keep_token: Uuid,
    ) -> AuthResult<()> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Account not found".to_string()))?;
        if !password::verify_password(current_password, &account.password_hash) {
            return Err(AuthError::Authentication(
                "Current password is incorrect".to_string(),
            ));
        }
        if let Some(message) = password::password_policy_error(new_password) {
            return Err(AuthError::Validation(message));
        }
        let hash = password::hash_password(new_password)?;
        self.accounts.set_password_hash(account_id, &hash).await?;
        self.tokens.revoke_others(account_id, keep_token).await?;
        self.record_event("password_changed", json!({ "account_id": account_id }))
            .await;
        Ok(())
    }

    /// Disabling the second factor requires the current password, not just a
    /// live session.
    pub async fn disable_two_factor(&self, account_id: Uuid, current_password: &str) -> AuthResult<()> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Account not found".to_string()))?;
        if !password::verify_password(current_password, &account.password_hash) {
            return Err(AuthError::Authentication(
                "Current password is incorrect".to_string(),
            ));
        }
        self.two_factor.disable(account_id).await?;
        self.record_event("2fa_disabled", json!({ "account_id": account_id }))
            .await;
        Ok(())
    }

    /// Admin operation: clear an active lockout.
    pub async fn clear_lockout(&self, account_id: Uuid) -> AuthResult<()> {
        self.accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Account not found".to_string()))?;
        self.accounts.clear_lock(account_id).await?;
        self.record_event("lockout_cleared", json!({ "account_id": account_id }))
            .await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypter::{ChaChaSecretCrypter, KEY_LEN};
    use crate::store::{
        MemoryAuditStore, MemoryBlockedIpStore, MemoryCounterStore, MemoryStore,
    };
    use chrono::Utc;

    pub(crate) struct Fixture {
        pub clock: Arc<ManualClock>,
        pub store: Arc<MemoryStore>,
        pub service: AuthService,
        pub two_factor: TwoFactorService,
        pub issuer: TokenIssuer,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_default_rbac());
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let audit = Arc::new(MemoryAuditStore::new());
        let crypter = Arc::new(ChaChaSecretCrypter::new(&[9u8; KEY_LEN]).unwrap());

        let rbac = RbacService::new(store.clone());
        let issuer = TokenIssuer::new(store.clone(), clock.clone());
        let two_factor = TwoFactorService::new(
            store.clone(),
            crypter,
            clock.clone(),
            "custodia".to_string(),
        );
        let limiter = RateLimiter::new(counters.clone());
        let blocklist = IpBlocklist::new(
            Arc::new(MemoryBlockedIpStore::new(clock.clone())),
            counters,
            audit.clone(),
            clock.clone(),
        );
        let service = AuthService::new(
            store.clone(),
            rbac,
            issuer.clone(),
            two_factor.clone(),
            limiter,
            blocklist,
            audit,
            clock.clone(),
            AuthConfig::default(),
        );
        Fixture {
            clock,
            store,
            service,
            two_factor,
            issuer,
        }
    }

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            name: "Alice".to_string(),
            username: "alice".to_string(),
            email: "a@x.com".to_string(),
            password: "Abcd1234!".to_string(),
        }
    }

    #[test]
    fn email_shape_classification() {
        assert!(looks_like_email("a@x.com"));
        assert!(!looks_like_email("alice"));
        assert!(!looks_like_email("@x.com"));
        assert!(!looks_like_email("a@localhost"));
    }

    #[tokio::test]
    async fn register_then_login_yields_default_abilities() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        let outcome = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap();
        let LoginOutcome::Authenticated(session) = outcome else {
            panic!("expected a session");
        };
        assert!(session.abilities.contains(&"posts.create".to_string()));
        assert!(session.abilities.contains(&"posts.view".to_string()));
        assert!(f.issuer.authenticate(&session.token).await.is_ok());
        assert_eq!(session.account.last_login_ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn login_by_username_also_works() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();
        let outcome = f
            .service
            .login("alice", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn unknown_identifier_is_indistinguishable_from_bad_password() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        let missing = f
            .service
            .login("nobody@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap_err();
        let wrong = f
            .service
            .login("a@x.com", "WrongPass1", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(missing.public_message(), wrong.public_message());
    }

    #[tokio::test]
    async fn fifth_failure_locks_and_correct_password_stays_locked() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        for _ in 0..5 {
            let err = f
                .service
                .login("a@x.com", "WrongPass1", "web", "10.0.0.1")
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AuthError::Authentication(_) | AuthError::RateLimited { .. }
            ));
        }

        // Different address so the throttle is fresh; the account lock alone
        // must still reject correct credentials.
        let err = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.2")
            .await
            .unwrap_err();
        let AuthError::Locked {
            retry_after_seconds,
        } = err
        else {
            panic!("expected lockout, got {err:?}");
        };
        assert!(retry_after_seconds > 0 && retry_after_seconds <= 30 * 60);

        f.clock.advance(Duration::minutes(31));
        let outcome = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.2")
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let f = fixture();
        let account = f.service.register(register_request()).await.unwrap();

        for _ in 0..3 {
            let _ = f
                .service
                .login("a@x.com", "WrongPass1", "web", "10.0.0.1")
                .await;
        }
        let record = f.store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(record.failed_login_attempts, 3);

        f.service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap();
        let record = f.store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(record.failed_login_attempts, 0);
        assert!(record.locked_until.is_none());
    }

    #[tokio::test]
    async fn throttle_rejects_before_credentials_are_checked() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        for _ in 0..5 {
            let _ = f
                .service
                .login("a@x.com", "WrongPass1", "web", "10.0.0.1")
                .await;
        }
        let err = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn deactivated_accounts_cannot_login() {
        let f = fixture();
        let account = f.service.register(register_request()).await.unwrap();
        f.store.set_active(account.id, false).await.unwrap();

        let err = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
    }

    #[tokio::test]
    async fn blocked_address_is_rejected_before_anything_else() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        // 20 failures from one address trip the automatic block. Spread over
        // distinct identifiers so the per-identifier throttle never engages.
        for i in 0..20 {
            let _ = f
                .service
                .login(&format!("ghost{i}@x.com"), "WrongPass1", "web", "10.9.9.9")
                .await;
        }
        let err = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.9.9.9")
            .await
            .unwrap_err();
        let AuthError::RateLimited {
            retry_after_seconds,
        } = err
        else {
            panic!("expected 429, got {err:?}");
        };
        assert!(retry_after_seconds > 0 && retry_after_seconds <= 2 * 3600);

        // Other addresses are unaffected.
        assert!(
            f.service
                .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn hammering_one_identifier_still_trips_the_address_block() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();

        // Only the first five failures are counted by the login throttle; the
        // rest are rejected as throttled but must still raise suspicion.
        for _ in 0..20 {
            let _ = f
                .service
                .login("a@x.com", "WrongPass1", "web", "10.9.9.8")
                .await;
        }

        let err = f
            .service
            .login("ghost@x.com", "WrongPass1", "web", "10.9.9.8")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));

        // Same probe from a clean address fails on credentials, not a block.
        let err = f
            .service
            .login("ghost@x.com", "WrongPass1", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn two_factor_login_handshake() {
        let f = fixture();
        let account = f.service.register(register_request()).await.unwrap();
        let setup = f.two_factor.enable(account.id).await.unwrap();
        f.store
            .set_two_factor_enabled(account.id, true)
            .await
            .unwrap();

        let outcome = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap();
        let LoginOutcome::TwoFactorRequired { pending_token } = outcome else {
            panic!("expected pending 2FA");
        };

        // Wrong code consumes the pending token.
        let err = f
            .service
            .verify_two_factor(&pending_token, "000000", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
        let err = f
            .service
            .verify_two_factor(&pending_token, "000000", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));

        // Fresh login, then redeem with a recovery code.
        let LoginOutcome::TwoFactorRequired { pending_token } = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap()
        else {
            panic!("expected pending 2FA");
        };
        let session = f
            .service
            .verify_two_factor(&pending_token, &setup.recovery_codes[0], "web", "10.0.0.1")
            .await
            .unwrap();
        assert!(f.issuer.authenticate(&session.token).await.is_ok());
    }

    #[tokio::test]
    async fn expired_pending_token_forces_a_new_login() {
        let f = fixture();
        let account = f.service.register(register_request()).await.unwrap();
        f.two_factor.enable(account.id).await.unwrap();
        f.store
            .set_two_factor_enabled(account.id, true)
            .await
            .unwrap();

        let LoginOutcome::TwoFactorRequired { pending_token } = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap()
        else {
            panic!("expected pending 2FA");
        };
        f.clock.advance(Duration::minutes(11));
        let err = f
            .service
            .verify_two_factor(&pending_token, "000000", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn update_password_revokes_other_sessions() {
        let f = fixture();
        f.service.register(register_request()).await.unwrap();
        let LoginOutcome::Authenticated(web) = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.1")
            .await
            .unwrap()
        else {
            panic!("expected session");
        };
        let LoginOutcome::Authenticated(phone) = f
            .service
            .login("a@x.com", "Abcd1234!", "phone", "10.0.0.1")
            .await
            .unwrap()
        else {
            panic!("expected session");
        };

        assert!(matches!(
            f.service
                .update_password(web.account.id, "WrongPass1", "Efgh5678!", web.token_id)
                .await,
            Err(AuthError::Authentication(_))
        ));

        f.service
            .update_password(web.account.id, "Abcd1234!", "Efgh5678!", web.token_id)
            .await
            .unwrap();
        assert!(f.issuer.authenticate(&web.token).await.is_ok());
        assert!(f.issuer.authenticate(&phone.token).await.is_err());

        let outcome = f
            .service
            .login("a@x.com", "Efgh5678!", "web", "10.0.0.1")
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn clear_lockout_restores_access() {
        let f = fixture();
        let account = f.service.register(register_request()).await.unwrap();
        for _ in 0..5 {
            let _ = f
                .service
                .login("a@x.com", "WrongPass1", "web", "10.0.0.1")
                .await;
        }
        f.service.clear_lockout(account.id).await.unwrap();
        let outcome = f
            .service
            .login("a@x.com", "Abcd1234!", "web", "10.0.0.2")
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn register_validation() {
        let f = fixture();
        let mut bad = register_request();
        bad.email = "not-an-email".to_string();
        assert!(matches!(
            f.service.register(bad).await,
            Err(AuthError::Validation(_))
        ));

        let mut bad = register_request();
        bad.username = "x".to_string();
        assert!(matches!(
            f.service.register(bad).await,
            Err(AuthError::Validation(_))
        ));

        let mut bad = register_request();
        bad.password = "short1".to_string();
        assert!(matches!(
            f.service.register(bad).await,
            Err(AuthError::Validation(_))
        ));

        f.service.register(register_request()).await.unwrap();
        assert!(matches!(
            f.service.register(register_request()).await,
            Err(AuthError::Conflict(_))
        ));
    }
}
