//! Social-identity login and linking.
//!
//! The OAuth handshake itself happens elsewhere; this module receives a
//! provider access token, resolves it to a normalized identity, and then
//! finds, links, or creates the matching account. At most one provider link
//! per account.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypter::SecretCrypter;
use crate::error::{AuthError, AuthResult};
use crate::ratelimit::IpBlocklist;
use crate::rbac::{DEFAULT_ROLE, RbacService};
use crate::store::{AccountRecord, AccountStore, AuditEvent, AuditStore, InsertOutcome, NewAccount};
use crate::tokens::TokenIssuer;

use super::Session;
use super::password;

pub const SUPPORTED_PROVIDERS: [&str; 3] = ["google", "github", "facebook"];

const PROVIDER_TOKEN_CONTEXT: &str = "provider-token";

/// Normalized identity returned by a provider.
#[derive(Clone, Debug)]
pub struct ExternalIdentity {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub provider_token: Option<String>,
}

/// Exchange a provider access token for a stable external identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, provider: &str, access_token: &str) -> Result<ExternalIdentity>;
}

/// Resolver backed by the providers' user-info endpoints.
#[derive(Clone)]
pub struct HttpIdentityResolver {
    client: reqwest::Client,
}

impl HttpIdentityResolver {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to build identity resolver client")?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str, access_token: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("provider request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("provider rejected the token: {}", response.status()));
        }
        response.json().await.context("invalid provider response")
    }
}

fn required_str(value: &serde_json::Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("provider response missing {field}"))
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, provider: &str, access_token: &str) -> Result<ExternalIdentity> {
        match provider {
            "google" => {
                let body = self
                    .fetch("https://www.googleapis.com/oauth2/v3/userinfo", access_token)
                    .await?;
                Ok(ExternalIdentity {
                    external_id: required_str(&body, "sub")?,
                    email: required_str(&body, "email")?,
                    display_name: required_str(&body, "name").unwrap_or_default(),
                    avatar_url: body
                        .get("picture")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    provider_token: Some(access_token.to_string()),
                })
            }
            "github" => {
                let body = self.fetch("https://api.github.com/user", access_token).await?;
                let login = required_str(&body, "login")?;
                let email = body
                    .get("email")
                    .and_then(serde_json::Value::as_str)
                    .map_or_else(|| format!("{login}@users.noreply.github.com"), str::to_string);
                Ok(ExternalIdentity {
                    external_id: body
                        .get("id")
                        .and_then(serde_json::Value::as_i64)
                        .map(|id| id.to_string())
                        .ok_or_else(|| anyhow!("provider response missing id"))?,
                    email,
                    display_name: required_str(&body, "name").unwrap_or(login),
                    avatar_url: body
                        .get("avatar_url")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    provider_token: Some(access_token.to_string()),
                })
            }
            "facebook" => {
                let body = self
                    .fetch(
                        "https://graph.facebook.com/me?fields=id,name,email,picture",
                        access_token,
                    )
                    .await?;
                Ok(ExternalIdentity {
                    external_id: required_str(&body, "id")?,
                    email: required_str(&body, "email")?,
                    display_name: required_str(&body, "name").unwrap_or_default(),
                    avatar_url: body
                        .pointer("/picture/data/url")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    provider_token: Some(access_token.to_string()),
                })
            }
            other => Err(anyhow!("unsupported provider: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct SocialAuthService {
    accounts: Arc<dyn AccountStore>,
    rbac: RbacService,
    tokens: TokenIssuer,
    crypter: Arc<dyn SecretCrypter>,
    resolver: Arc<dyn IdentityResolver>,
    blocklist: IpBlocklist,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl SocialAuthService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        rbac: RbacService,
        tokens: TokenIssuer,
        crypter: Arc<dyn SecretCrypter>,
        resolver: Arc<dyn IdentityResolver>,
        blocklist: IpBlocklist,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            rbac,
            tokens,
            crypter,
            resolver,
            blocklist,
            audit,
            clock,
        }
    }

    /// Sign in with a provider access token: reuse the linked account, link
    /// by verified email, or create a fresh account, in that order.
    pub async fn login(
        &self,
        provider: &str,
        access_token: &str,
        device_label: &str,
        ip: &str,
    ) -> AuthResult<Session> {
        if !SUPPORTED_PROVIDERS.contains(&provider) {
            return Err(AuthError::Validation(format!(
                "Unsupported provider: {provider}"
            )));
        }
        if let Some(entry) = self.blocklist.info(ip).await? {
            let retry = (entry.blocked_until - self.clock.now()).num_seconds().max(1);
            return Err(AuthError::RateLimited {
                retry_after_seconds: retry,
            });
        }

        let identity = match self.resolver.resolve(provider, access_token).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(provider, error = %err, "identity resolution failed");
                return Err(AuthError::Authentication(format!(
                    "Could not verify your {provider} identity"
                )));
            }
        };

        let account = self
            .find_or_create(provider, &identity)
            .await?;
        if !account.is_active {
            return Err(AuthError::Forbidden(
                "Your account has been deactivated".to_string(),
            ));
        }
        self.record_event(
            "social_login",
            json!({ "account_id": account.id, "provider": provider }),
        )
        .await;
        self.finalize(account, device_label, ip).await
    }

    async fn find_or_create(
        &self,
        provider: &str,
        identity: &ExternalIdentity,
    ) -> AuthResult<AccountRecord> {
        if let Some(account) = self
            .accounts
            .find_by_provider(provider, &identity.external_id)
            .await?
        {
            return Ok(account);
        }

        if let Some(account) = self.accounts.find_by_email(&identity.email).await? {
            self.link_identity(account.id, provider, identity).await?;
            return self
                .accounts
                .find_by_id(account.id)
                .await?
                .ok_or_else(|| AuthError::Internal(anyhow!("linked account disappeared")));
        }

        let username = self.free_username(&identity.email).await?;
        // Social accounts get an unguessable password; a usable one arrives
        // only through the reset flow.
        let placeholder = crate::tokens::generate_token()?;
        let new = NewAccount {
            name: if identity.display_name.is_empty() {
                username.clone()
            } else {
                identity.display_name.clone()
            },
            username,
            email: identity.email.to_lowercase(),
            password_hash: password::hash_password(&placeholder)?,
            avatar_url: identity.avatar_url.clone(),
            // The provider vouches for the address.
            email_verified_at: Some(self.clock.now()),
            provider: None,
            provider_id: None,
            provider_token: None,
            created_at: self.clock.now(),
        };
        let account = match self.accounts.create_account(new, DEFAULT_ROLE).await? {
            InsertOutcome::Inserted(account) => account,
            InsertOutcome::Conflict => {
                return Err(AuthError::Conflict(
                    "An account with this email or username already exists".to_string(),
                ));
            }
        };
        self.link_identity(account.id, provider, identity).await?;
        self.accounts
            .find_by_id(account.id)
            .await?
            .ok_or_else(|| AuthError::Internal(anyhow!("created account disappeared")))
    }

    async fn link_identity(
        &self,
        account_id: Uuid,
        provider: &str,
        identity: &ExternalIdentity,
    ) -> AuthResult<()> {
        let encrypted = identity
            .provider_token
            .as_deref()
            .map(|token| {
                self.crypter
                    .encrypt(token.as_bytes(), account_id, PROVIDER_TOKEN_CONTEXT)
            })
            .transpose()?;
        self.accounts
            .link_provider(
                account_id,
                provider,
                &identity.external_id,
                encrypted.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn free_username(&self, email: &str) -> AuthResult<String> {
        let base: String = email
            .split('@')
            .next()
            .unwrap_or("user")
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            .collect();
        let base = if base.chars().count() < 3 {
            format!("user-{base}")
        } else {
            base
        };

        if self.accounts.find_by_username(&base).await?.is_none() {
            return Ok(base);
        }
        for n in 1..=50u32 {
            let candidate = format!("{base}{n}");
            if self.accounts.find_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(AuthError::Internal(anyhow!(
            "could not allocate a username for {base}"
        )))
    }

    /// Detach the provider link. The account keeps its password login.
    pub async fn unlink(&self, account_id: Uuid) -> AuthResult<()> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Account not found".to_string()))?;
        if account.provider.is_none() {
            return Err(AuthError::Validation(
                "No social account is linked".to_string(),
            ));
        }
        self.accounts.unlink_provider(account_id).await?;
        self.record_event("social_unlinked", json!({ "account_id": account_id }))
            .await;
        Ok(())
    }

    async fn finalize(
        &self,
        account: AccountRecord,
        device_label: &str,
        ip: &str,
    ) -> AuthResult<Session> {
        let now = self.clock.now();
        self.accounts.record_login(account.id, ip, now).await?;
        let abilities = self.rbac.effective_slugs(account.id).await?;
        let (token, record) = self
            .tokens
            .issue_session(account.id, device_label, abilities.clone(), None)
            .await?;
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

    async fn record_event(&self, kind: &str, payload: serde_json::Value) {
        let event = AuditEvent::new(kind, payload, self.clock.now());
        if let Err(err) = self.audit.record(event).await {
            tracing::warn!(kind, error = %err, "failed to record security event");
        }
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

    struct FakeResolver {
        identity: ExternalIdentity,
    }

    #[async_trait]
    impl IdentityResolver for FakeResolver {
        async fn resolve(&self, _provider: &str, access_token: &str) -> Result<ExternalIdentity> {
            if access_token == "bad-token" {
                return Err(anyhow!("provider rejected the token: 401"));
            }
            Ok(self.identity.clone())
        }
    }

    fn identity() -> ExternalIdentity {
        ExternalIdentity {
            external_id: "ext-123".to_string(),
            email: "alice@example.com".to_string(),
            display_name: "Alice Doe".to_string(),
            avatar_url: Some("https://cdn.example.com/alice.png".to_string()),
            provider_token: Some("provider-access-token".to_string()),
        }
    }

    fn service(identity: ExternalIdentity) -> (Arc<MemoryStore>, SocialAuthService) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_default_rbac());
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let audit = Arc::new(MemoryAuditStore::new());
        let blocklist = IpBlocklist::new(
            Arc::new(MemoryBlockedIpStore::new(clock.clone())),
            counters,
            audit.clone(),
            clock.clone(),
        );
        let service = SocialAuthService::new(
            store.clone(),
            RbacService::new(store.clone()),
            TokenIssuer::new(store.clone(), clock.clone()),
            Arc::new(ChaChaSecretCrypter::new(&[3u8; KEY_LEN]).unwrap()),
            Arc::new(FakeResolver { identity }),
            blocklist,
            audit,
            clock,
        );
        (store, service)
    }

    #[tokio::test]
    async fn first_login_creates_a_verified_account_with_default_role() {
        let (store, service) = service(identity());
        let session = service
            .login("google", "good-token", "web", "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(session.account.email, "alice@example.com");
        assert_eq!(session.account.username, "alice");
        assert!(session.account.email_verified());
        assert_eq!(session.account.provider.as_deref(), Some("google"));
        assert!(session.abilities.contains(&"posts.view".to_string()));

        // Second login resolves to the same account.
        let again = service
            .login("google", "good-token", "web", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(again.account.id, session.account.id);
        assert_eq!(store.find_by_email("alice@example.com").await.unwrap().unwrap().id, session.account.id);
    }

    #[tokio::test]
    async fn existing_email_account_gets_linked() {
        let (store, service) = service(identity());
        let existing = store
            .create_account(
                NewAccount {
                    name: "Alice".to_string(),
                    username: "alice".to_string(),
                    email: "alice@example.com".to_string(),
                    password_hash: password::hash_password("Abcd1234!").unwrap(),
                    avatar_url: None,
                    email_verified_at: None,
                    provider: None,
                    provider_id: None,
                    provider_token: None,
                    created_at: Utc::now(),
                },
                DEFAULT_ROLE,
            )
            .await
            .unwrap();
        let InsertOutcome::Inserted(existing) = existing else {
            panic!("expected insert");
        };

        let session = service
            .login("github", "good-token", "web", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(session.account.id, existing.id);
        assert_eq!(session.account.provider.as_deref(), Some("github"));
        assert!(session.account.provider_token.is_some());
    }

    #[tokio::test]
    async fn username_collisions_get_a_suffix() {
        let (store, service) = service(ExternalIdentity {
            email: "alice@other.org".to_string(),
            ..identity()
        });
        store
            .create_account(
                NewAccount {
                    name: "Other Alice".to_string(),
                    username: "alice".to_string(),
                    email: "taken@example.com".to_string(),
                    password_hash: "hash".to_string(),
                    avatar_url: None,
                    email_verified_at: None,
                    provider: None,
                    provider_id: None,
                    provider_token: None,
                    created_at: Utc::now(),
                },
                DEFAULT_ROLE,
            )
            .await
            .unwrap();

        let session = service
            .login("google", "good-token", "web", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(session.account.username, "alice1");
    }

    #[tokio::test]
    async fn provider_rejection_is_an_authentication_failure() {
        let (_store, service) = service(identity());
        let err = service
            .login("google", "bad-token", "web", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn unsupported_provider_is_rejected_up_front() {
        let (_store, service) = service(identity());
        assert!(matches!(
            service.login("myspace", "token", "web", "10.0.0.1").await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unlink_requires_an_existing_link() {
        let (_store, service) = service(identity());
        let session = service
            .login("google", "good-token", "web", "10.0.0.1")
            .await
            .unwrap();

        service.unlink(session.account.id).await.unwrap();
        assert!(matches!(
            service.unlink(session.account.id).await,
            Err(AuthError::Validation(_))
        ));
    }
}
