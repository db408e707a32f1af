//! TOTP second factor.
//!
//! Enablement is two-step: `enable` provisions an encrypted secret and a
//! recovery set but leaves the account's flag off; `confirm_enable` flips it
//! only after the user proves they can produce a valid code. Verification
//! accepts either a current TOTP code or an unused recovery code; a recovery
//! code that verifies is gone for good.

use anyhow::anyhow;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypter::SecretCrypter;
use crate::error::{AuthError, AuthResult};
use crate::store::{AccountRecord, AccountStore};

pub mod recovery;

const SECRET_CONTEXT: &str = "totp-secret";
const RECOVERY_CONTEXT: &str = "recovery-codes";

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP: u64 = 30;

/// Material handed back once at setup; never retrievable again.
#[derive(Clone, Debug)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub otpauth_url: String,
    pub recovery_codes: Vec<String>,
}

#[derive(Clone)]
pub struct TwoFactorService {
    accounts: Arc<dyn AccountStore>,
    crypter: Arc<dyn SecretCrypter>,
    clock: Arc<dyn Clock>,
    issuer: String,
}

impl TwoFactorService {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        crypter: Arc<dyn SecretCrypter>,
        clock: Arc<dyn Clock>,
        issuer: String,
    ) -> Self {
        Self {
            accounts,
            crypter,
            clock,
            issuer,
        }
    }

    async fn account(&self, account_id: Uuid) -> AuthResult<AccountRecord> {
        self.accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Account not found".to_string()))
    }

    fn build_totp(&self, secret_bytes: Vec<u8>, account_label: &str) -> AuthResult<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            account_label.to_string(),
        )
        .map_err(|e| AuthError::Internal(anyhow!("TOTP init error: {e}")))
    }

    fn decrypt_secret(&self, account: &AccountRecord) -> AuthResult<Vec<u8>> {
        let ciphertext = account
            .two_factor_secret
            .as_deref()
            .ok_or_else(|| AuthError::Validation("Two-factor setup not started".to_string()))?;
        Ok(self.crypter.decrypt(ciphertext, account.id, SECRET_CONTEXT)?)
    }

    fn check_code(&self, totp: &TOTP, code: &str) -> bool {
        let timestamp = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
        totp.check(code, timestamp)
    }

    /// Provision a secret and recovery set. The second factor stays off until
    /// `confirm_enable` sees a valid code.
    pub async fn enable(&self, account_id: Uuid) -> AuthResult<TwoFactorSetup> {
        let account = self.account(account_id).await?;
        if account.two_factor_enabled {
            return Err(AuthError::Conflict(
                "Two-factor authentication is already enabled".to_string(),
            ));
        }

        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow!("secret generation error: {e}")))?;
        let recovery_codes = recovery::generate_codes();

        let encrypted_secret = self
            .crypter
            .encrypt(&secret_bytes, account_id, SECRET_CONTEXT)?;
        let encrypted_codes = self.crypter.encrypt(
            &recovery::encode_set(&recovery_codes)?,
            account_id,
            RECOVERY_CONTEXT,
        )?;
        self.accounts
            .set_two_factor_setup(account_id, &encrypted_secret, &encrypted_codes)
            .await?;

        let totp = self.build_totp(secret_bytes, &account.email)?;
        Ok(TwoFactorSetup {
            secret: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
            recovery_codes,
        })
    }

    /// Flip the account's flag once the user proves possession of the secret.
    pub async fn confirm_enable(&self, account_id: Uuid, code: &str) -> AuthResult<()> {
        let account = self.account(account_id).await?;
        if account.two_factor_enabled {
            return Ok(());
        }
        let secret_bytes = self.decrypt_secret(&account)?;
        let totp = self.build_totp(secret_bytes, &account.email)?;
        if !self.check_code(&totp, code) {
            return Err(AuthError::Validation(
                "Invalid verification code".to_string(),
            ));
        }
        self.accounts.set_two_factor_enabled(account_id, true).await?;
        Ok(())
    }

    /// Check a TOTP code, falling back to the recovery set. A matched
    /// recovery code is removed before this returns.
    pub async fn verify(&self, account_id: Uuid, code: &str) -> AuthResult<bool> {
        let account = self.account(account_id).await?;
        if !account.two_factor_enabled {
            return Err(AuthError::Validation(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }

        let secret_bytes = self.decrypt_secret(&account)?;
        let totp = self.build_totp(secret_bytes, &account.email)?;
        if self.check_code(&totp, code) {
            return Ok(true);
        }

        let Some(ciphertext) = account.two_factor_recovery_codes.as_deref() else {
            return Ok(false);
        };
        let codes = recovery::decode_set(&self.crypter.decrypt(
            ciphertext,
            account_id,
            RECOVERY_CONTEXT,
        )?)?;
        let Some(remaining) = recovery::consume(&codes, code) else {
            return Ok(false);
        };
        let encrypted = self.crypter.encrypt(
            &recovery::encode_set(&remaining)?,
            account_id,
            RECOVERY_CONTEXT,
        )?;
        self.accounts.set_recovery_codes(account_id, &encrypted).await?;
        Ok(true)
    }

    /// Drop the secret, the recovery set, and the flag in one write. The
    /// caller is responsible for re-authenticating the user first.
    pub async fn disable(&self, account_id: Uuid) -> AuthResult<()> {
        let account = self.account(account_id).await?;
        if !account.two_factor_enabled {
            return Err(AuthError::Validation(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }
        self.accounts.clear_two_factor(account_id).await?;
        Ok(())
    }

    /// Replace the recovery set; old codes stop working immediately.
    pub async fn regenerate_recovery_codes(&self, account_id: Uuid) -> AuthResult<Vec<String>> {
        let account = self.account(account_id).await?;
        if !account.two_factor_enabled {
            return Err(AuthError::Validation(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }
        let codes = recovery::generate_codes();
        let encrypted =
            self.crypter
                .encrypt(&recovery::encode_set(&codes)?, account_id, RECOVERY_CONTEXT)?;
        self.accounts.set_recovery_codes(account_id, &encrypted).await?;
        Ok(codes)
    }

    pub async fn is_enabled(&self, account_id: Uuid) -> AuthResult<bool> {
        Ok(self.account(account_id).await?.two_factor_enabled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypter::{ChaChaSecretCrypter, KEY_LEN};
    use crate::store::{InsertOutcome, MemoryStore, NewAccount};
    use chrono::{Duration, Utc};

    struct Fixture {
        clock: Arc<ManualClock>,
        service: TwoFactorService,
        account_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_default_rbac());
        let crypter = Arc::new(ChaChaSecretCrypter::new(&[7u8; KEY_LEN]).unwrap());
        let service = TwoFactorService::new(
            store.clone(),
            crypter,
            clock.clone(),
            "custodia".to_string(),
        );
        let outcome = store
            .create_account(
                NewAccount {
                    name: "Alice".to_string(),
                    username: "alice".to_string(),
                    email: "alice@example.com".to_string(),
                    password_hash: "hash".to_string(),
                    avatar_url: None,
                    email_verified_at: None,
                    provider: None,
                    provider_id: None,
                    provider_token: None,
                    created_at: Utc::now(),
                },
                "user",
            )
            .await
            .unwrap();
        let InsertOutcome::Inserted(account) = outcome else {
            panic!("expected insert");
        };
        Fixture {
            clock,
            service,
            account_id: account.id,
        }
    }

    fn code_for(setup: &TwoFactorSetup, clock: &ManualClock) -> String {
        let bytes = Secret::Encoded(setup.secret.clone()).to_bytes().unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP,
            bytes,
            Some("custodia".to_string()),
            "alice@example.com".to_string(),
        )
        .unwrap();
        totp.generate(u64::try_from(clock.now().timestamp()).unwrap())
    }

    #[tokio::test]
    async fn wrong_confirmation_code_leaves_the_factor_off() {
        let f = fixture().await;
        let _setup = f.service.enable(f.account_id).await.unwrap();

        let err = f
            .service
            .confirm_enable(f.account_id, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        assert!(!f.service.is_enabled(f.account_id).await.unwrap());
    }

    #[tokio::test]
    async fn enable_confirm_verify_roundtrip() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        assert_eq!(setup.recovery_codes.len(), recovery::RECOVERY_CODE_COUNT);
        assert!(setup.otpauth_url.starts_with("otpauth://totp/"));

        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();
        assert!(f.service.is_enabled(f.account_id).await.unwrap());

        // A code for the current step still verifies.
        let code = code_for(&setup, &f.clock);
        assert!(f.service.verify(f.account_id, &code).await.unwrap());
        assert!(!f.service.verify(f.account_id, "000000").await.unwrap());
    }

    #[tokio::test]
    async fn stale_codes_fail_outside_the_skew_window() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();

        let old_code = code_for(&setup, &f.clock);
        f.clock.advance(Duration::seconds(i64::try_from(STEP).unwrap() * 3));
        assert!(!f.service.verify(f.account_id, &old_code).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_code_verifies_exactly_once() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();

        let recovery_code = setup.recovery_codes[0].clone();
        assert!(f.service.verify(f.account_id, &recovery_code).await.unwrap());
        assert!(!f.service.verify(f.account_id, &recovery_code).await.unwrap());

        // The rest of the set is still intact.
        let other = setup.recovery_codes[1].clone();
        assert!(f.service.verify(f.account_id, &other).await.unwrap());
    }

    #[tokio::test]
    async fn regenerate_invalidates_old_recovery_codes() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();

        let fresh = f
            .service
            .regenerate_recovery_codes(f.account_id)
            .await
            .unwrap();
        assert_eq!(fresh.len(), recovery::RECOVERY_CODE_COUNT);
        assert!(
            !f.service
                .verify(f.account_id, &setup.recovery_codes[0])
                .await
                .unwrap()
        );
        assert!(f.service.verify(f.account_id, &fresh[0]).await.unwrap());
    }

    #[tokio::test]
    async fn disable_clears_everything() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();

        f.service.disable(f.account_id).await.unwrap();
        assert!(!f.service.is_enabled(f.account_id).await.unwrap());
        assert!(matches!(
            f.service.verify(f.account_id, "000000").await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn double_enable_conflicts() {
        let f = fixture().await;
        let setup = f.service.enable(f.account_id).await.unwrap();
        let code = code_for(&setup, &f.clock);
        f.service.confirm_enable(f.account_id, &code).await.unwrap();

        assert!(matches!(
            f.service.enable(f.account_id).await,
            Err(AuthError::Conflict(_))
        ));
    }
}
