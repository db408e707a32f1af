//! In-memory backend for tests and local development.
//!
//! A single `Mutex`-guarded state object implements every persistence trait,
//! so multi-write operations (registration, token replacement) are naturally
//! atomic. Counter and blocklist stores take an injected clock so decay
//! windows can be driven by tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::clock::Clock;

use super::{
    AccountRecord, AccountStore, AuditEvent, AuditStore, BlockedIpEntry, BlockedIpStore,
    CounterStore, EphemeralKind, EphemeralTokenRecord, EphemeralTokenStore, InsertOutcome,
    NewAccount, PermissionRecord, RbacStore, RoleRecord, TokenKind, TokenRecord, TokenStore,
};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, AccountRecord>,
    roles: HashMap<Uuid, RoleRecord>,
    permissions: HashMap<Uuid, PermissionRecord>,
    role_permissions: HashMap<Uuid, Vec<Uuid>>,
    account_roles: HashMap<Uuid, Vec<Uuid>>,
    account_permissions: HashMap<Uuid, Vec<Uuid>>,
    tokens: HashMap<Uuid, TokenRecord>,
    ephemeral: Vec<EphemeralTokenRecord>,
}

/// In-memory implementation of the account, RBAC, token, and ephemeral-token
/// stores.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New store pre-populated with the seeded roles and permissions:
    /// `admin` (global `*`), `moderator`, and the default `user` role.
    #[must_use]
    pub fn with_default_rbac() -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            let permissions: Vec<(&str, &str, &str)> = vec![
                ("*", "Full Access", "admin"),
                ("users.view", "View Users", "users"),
                ("users.create", "Create Users", "users"),
                ("users.edit", "Edit Users", "users"),
                ("users.delete", "Delete Users", "users"),
                ("posts.view", "View Posts", "posts"),
                ("posts.create", "Create Posts", "posts"),
                ("posts.edit", "Edit Posts", "posts"),
                ("posts.delete", "Delete Posts", "posts"),
                ("roles.manage", "Manage Roles", "admin"),
                ("permissions.manage", "Manage Permissions", "admin"),
            ];
            let mut by_slug: HashMap<&str, Uuid> = HashMap::new();
            for (slug, name, category) in permissions {
                let id = Uuid::new_v4();
                by_slug.insert(slug, id);
                state.permissions.insert(
                    id,
                    PermissionRecord {
                        id,
                        slug: slug.to_string(),
                        name: name.to_string(),
                        category: category.to_string(),
                    },
                );
            }

            let roles: Vec<(&str, &str, &str, Vec<&str>)> = vec![
                ("admin", "Administrator", "Full system access", vec!["*"]),
                (
                    "moderator",
                    "Moderator",
                    "Can moderate content",
                    vec!["users.view", "posts.view", "posts.edit", "posts.delete"],
                ),
                (
                    "user",
                    "User",
                    "Regular user access",
                    vec!["posts.view", "posts.create", "posts.edit"],
                ),
            ];
            for (slug, name, description, perms) in roles {
                let id = Uuid::new_v4();
                state.roles.insert(
                    id,
                    RoleRecord {
                        id,
                        slug: slug.to_string(),
                        name: name.to_string(),
                        description: Some(description.to_string()),
                    },
                );
                let ids = perms
                    .iter()
                    .filter_map(|slug| by_slug.get(slug).copied())
                    .collect();
                state.role_permissions.insert(id, ids);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(
        &self,
        new: NewAccount,
        default_role_slug: &str,
    ) -> Result<InsertOutcome<AccountRecord>> {
        let mut state = self.lock();
        let email = new.email.to_lowercase();
        let taken = state
            .accounts
            .values()
            .any(|a| a.email == email || a.username == new.username);
        if taken {
            return Ok(InsertOutcome::Conflict);
        }
        let default_role = state
            .roles
            .values()
            .find(|r| r.slug == default_role_slug)
            .map(|r| r.id)
            .ok_or_else(|| anyhow::anyhow!("default role {default_role_slug} is not seeded"))?;

        let record = AccountRecord {
            id: Uuid::new_v4(),
            name: new.name,
            username: new.username,
            email,
            password_hash: new.password_hash,
            avatar_url: new.avatar_url,
            is_active: true,
            email_verified_at: new.email_verified_at,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            last_login_ip: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            two_factor_recovery_codes: None,
            provider: new.provider,
            provider_id: new.provider_id,
            provider_token: new.provider_token,
            created_at: new.created_at,
        };
        let id = record.id;
        state.accounts.insert(id, record.clone());
        state.account_roles.insert(id, vec![default_role]);
        Ok(InsertOutcome::Inserted(record))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        let email = email.to_lowercase();
        Ok(self
            .lock()
            .accounts
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<AccountRecord>> {
        Ok(self
            .lock()
            .accounts
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn find_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<AccountRecord>> {
        Ok(self
            .lock()
            .accounts
            .values()
            .find(|a| {
                a.provider.as_deref() == Some(provider)
                    && a.provider_id.as_deref() == Some(provider_id)
            })
            .cloned())
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<u32> {
        let mut state = self.lock();
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("account not found"))?;
        account.failed_login_attempts += 1;
        if account.failed_login_attempts >= threshold {
            account.locked_until = Some(lock_until);
        }
        Ok(account.failed_login_attempts)
    }

    async fn reset_login_failures(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.failed_login_attempts = 0;
            account.locked_until = None;
        }
        Ok(())
    }

    async fn record_login(&self, id: Uuid, ip: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.last_login_at = Some(at);
            account.last_login_ip = Some(ip.to_string());
        }
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.password_hash = password_hash.to_string();
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.is_active = active;
        }
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.email_verified_at = Some(at);
        }
        Ok(())
    }

    async fn set_two_factor_setup(&self, id: Uuid, secret: &[u8], recovery: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.two_factor_secret = Some(secret.to_vec());
            account.two_factor_recovery_codes = Some(recovery.to_vec());
        }
        Ok(())
    }

    async fn set_two_factor_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.two_factor_enabled = enabled;
        }
        Ok(())
    }

    async fn set_recovery_codes(&self, id: Uuid, recovery: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.two_factor_recovery_codes = Some(recovery.to_vec());
        }
        Ok(())
    }

    async fn clear_two_factor(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.two_factor_enabled = false;
            account.two_factor_secret = None;
            account.two_factor_recovery_codes = None;
        }
        Ok(())
    }

    async fn link_provider(
        &self,
        id: Uuid,
        provider: &str,
        provider_id: &str,
        provider_token: Option<&[u8]>,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.provider = Some(provider.to_string());
            account.provider_id = Some(provider_id.to_string());
            account.provider_token = provider_token.map(<[u8]>::to_vec);
        }
        Ok(())
    }

    async fn unlink_provider(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            account.provider = None;
            account.provider_id = None;
            account.provider_token = None;
        }
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        self.reset_login_failures(id).await
    }
}

#[async_trait]
impl RbacStore for MemoryStore {
    async fn list_roles(&self) -> Result<Vec<RoleRecord>> {
        let mut roles: Vec<_> = self.lock().roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn find_role_by_id(&self, id: Uuid) -> Result<Option<RoleRecord>> {
        Ok(self.lock().roles.get(&id).cloned())
    }

    async fn find_role_by_slug(&self, slug: &str) -> Result<Option<RoleRecord>> {
        Ok(self
            .lock()
            .roles
            .values()
            .find(|r| r.slug == slug)
            .cloned())
    }

    async fn create_role(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<InsertOutcome<RoleRecord>> {
        let mut state = self.lock();
        if state.roles.values().any(|r| r.slug == slug) {
            return Ok(InsertOutcome::Conflict);
        }
        let record = RoleRecord {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        state.roles.insert(record.id, record.clone());
        state.role_permissions.insert(record.id, Vec::new());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn update_role(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<RoleRecord>> {
        let mut state = self.lock();
        let Some(role) = state.roles.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            role.name = name.to_string();
        }
        if let Some(description) = description {
            role.description = Some(description.to_string());
        }
        Ok(Some(role.clone()))
    }

    async fn delete_role(&self, id: Uuid) -> Result<bool> {
        let mut state = self.lock();
        let removed = state.roles.remove(&id).is_some();
        state.role_permissions.remove(&id);
        for roles in state.account_roles.values_mut() {
            roles.retain(|role_id| *role_id != id);
        }
        Ok(removed)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<PermissionRecord>> {
        let state = self.lock();
        let ids = state.role_permissions.get(&role_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.permissions.get(id).cloned())
            .collect())
    }

    async fn set_role_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut state = self.lock();
        let valid: Vec<Uuid> = permission_ids
            .iter()
            .filter(|id| state.permissions.contains_key(id))
            .copied()
            .collect();
        state.role_permissions.insert(role_id, valid);
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>> {
        let mut permissions: Vec<_> = self.lock().permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(permissions)
    }

    async fn find_permission_by_id(&self, id: Uuid) -> Result<Option<PermissionRecord>> {
        Ok(self.lock().permissions.get(&id).cloned())
    }

    async fn find_permissions_by_slugs(&self, slugs: &[String]) -> Result<Vec<PermissionRecord>> {
        let state = self.lock();
        Ok(state
            .permissions
            .values()
            .filter(|p| slugs.contains(&p.slug))
            .cloned()
            .collect())
    }

    async fn create_permission(
        &self,
        slug: &str,
        name: &str,
        category: &str,
    ) -> Result<InsertOutcome<PermissionRecord>> {
        let mut state = self.lock();
        if state.permissions.values().any(|p| p.slug == slug) {
            return Ok(InsertOutcome::Conflict);
        }
        let record = PermissionRecord {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            category: category.to_string(),
        };
        state.permissions.insert(record.id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn update_permission(
        &self,
        id: Uuid,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<PermissionRecord>> {
        let mut state = self.lock();
        let Some(permission) = state.permissions.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            permission.name = name.to_string();
        }
        if let Some(category) = category {
            permission.category = category.to_string();
        }
        Ok(Some(permission.clone()))
    }

    async fn delete_permission(&self, id: Uuid) -> Result<bool> {
        let mut state = self.lock();
        let removed = state.permissions.remove(&id).is_some();
        for ids in state.role_permissions.values_mut() {
            ids.retain(|perm_id| *perm_id != id);
        }
        for ids in state.account_permissions.values_mut() {
            ids.retain(|perm_id| *perm_id != id);
        }
        Ok(removed)
    }

    async fn roles_of(&self, account_id: Uuid) -> Result<Vec<RoleRecord>> {
        let state = self.lock();
        let ids = state.account_roles.get(&account_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.roles.get(id).cloned())
            .collect())
    }

    async fn assign_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let roles = state.account_roles.entry(account_id).or_default();
        if !roles.contains(&role_id) {
            roles.push(role_id);
        }
        Ok(())
    }

    async fn remove_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(roles) = state.account_roles.get_mut(&account_id) {
            roles.retain(|id| *id != role_id);
        }
        Ok(())
    }

    async fn sync_roles(&self, account_id: Uuid, role_ids: &[Uuid]) -> Result<()> {
        let mut state = self.lock();
        let valid: Vec<Uuid> = role_ids
            .iter()
            .filter(|id| state.roles.contains_key(id))
            .copied()
            .collect();
        state.account_roles.insert(account_id, valid);
        Ok(())
    }

    async fn direct_permissions_of(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>> {
        let state = self.lock();
        let ids = state
            .account_permissions
            .get(&account_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.permissions.get(id).cloned())
            .collect())
    }

    async fn grant_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut state = self.lock();
        let valid: Vec<Uuid> = permission_ids
            .iter()
            .filter(|id| state.permissions.contains_key(id))
            .copied()
            .collect();
        let granted = state.account_permissions.entry(account_id).or_default();
        for id in valid {
            if !granted.contains(&id) {
                granted.push(id);
            }
        }
        Ok(())
    }

    async fn revoke_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut state = self.lock();
        if let Some(granted) = state.account_permissions.get_mut(&account_id) {
            granted.retain(|id| !permission_ids.contains(id));
        }
        Ok(())
    }

    async fn sync_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut state = self.lock();
        let valid: Vec<Uuid> = permission_ids
            .iter()
            .filter(|id| state.permissions.contains_key(id))
            .copied()
            .collect();
        state.account_permissions.insert(account_id, valid);
        Ok(())
    }

    async fn effective_permissions(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>> {
        let state = self.lock();
        let mut seen: Vec<Uuid> = Vec::new();
        let mut out: Vec<PermissionRecord> = Vec::new();

        let role_ids = state.account_roles.get(&account_id).cloned().unwrap_or_default();
        for role_id in role_ids {
            for perm_id in state.role_permissions.get(&role_id).cloned().unwrap_or_default() {
                if !seen.contains(&perm_id) {
                    if let Some(perm) = state.permissions.get(&perm_id) {
                        seen.push(perm_id);
                        out.push(perm.clone());
                    }
                }
            }
        }
        for perm_id in state
            .account_permissions
            .get(&account_id)
            .cloned()
            .unwrap_or_default()
        {
            if !seen.contains(&perm_id) {
                if let Some(perm) = state.permissions.get(&perm_id) {
                    seen.push(perm_id);
                    out.push(perm.clone());
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn issue(&self, record: TokenRecord) -> Result<()> {
        let mut state = self.lock();
        if record.kind == TokenKind::Session {
            state.tokens.retain(|_, t| {
                !(t.kind == TokenKind::Session
                    && t.account_id == record.account_id
                    && t.label == record.label)
            });
        }
        state.tokens.insert(record.id, record);
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<TokenRecord>> {
        Ok(self
            .lock()
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        self.lock().tokens.remove(&id);
        Ok(())
    }

    async fn delete_all_for_account(&self, account_id: Uuid) -> Result<u64> {
        let mut state = self.lock();
        let before = state.tokens.len();
        state.tokens.retain(|_, t| t.account_id != account_id);
        Ok((before - state.tokens.len()) as u64)
    }

    async fn delete_all_except(&self, account_id: Uuid, keep: Uuid) -> Result<u64> {
        let mut state = self.lock();
        let before = state.tokens.len();
        state
            .tokens
            .retain(|_, t| t.account_id != account_id || t.id == keep);
        Ok((before - state.tokens.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.tokens.len();
        state.tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - state.tokens.len()) as u64)
    }
}

#[async_trait]
impl EphemeralTokenStore for MemoryStore {
    async fn replace_for_owner(&self, record: EphemeralTokenRecord) -> Result<()> {
        let mut state = self.lock();
        state
            .ephemeral
            .retain(|t| !(t.kind == record.kind && t.owner_email == record.owner_email));
        state.ephemeral.push(record);
        Ok(())
    }

    async fn find_by_hash(
        &self,
        kind: EphemeralKind,
        token_hash: &[u8],
    ) -> Result<Option<EphemeralTokenRecord>> {
        Ok(self
            .lock()
            .ephemeral
            .iter()
            .find(|t| t.kind == kind && t.token_hash == token_hash)
            .cloned())
    }

    async fn latest_created_for_owner(
        &self,
        kind: EphemeralKind,
        owner_email: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .lock()
            .ephemeral
            .iter()
            .filter(|t| t.kind == kind && t.owner_email == owner_email)
            .map(|t| t.created_at)
            .max())
    }

    async fn delete_all_for_owner(&self, kind: EphemeralKind, owner_email: &str) -> Result<u64> {
        let mut state = self.lock();
        let before = state.ephemeral.len();
        state
            .ephemeral
            .retain(|t| !(t.kind == kind && t.owner_email == owner_email));
        Ok((before - state.ephemeral.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.ephemeral.len();
        state.ephemeral.retain(|t| t.expires_at > now);
        Ok((before - state.ephemeral.len()) as u64)
    }
}

/// Decaying counter store with an injected clock.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, DateTime<Utc>)>> {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl_seconds: i64) -> Result<u64> {
        let now = self.clock.now();
        let mut counters = self.lock();
        let entry = counters
            .entry(key.to_string())
            .and_modify(|(count, expires)| {
                if *expires <= now {
                    // Window decayed; start a fresh one.
                    *count = 0;
                    *expires = now + Duration::seconds(ttl_seconds);
                }
                *count += 1;
            })
            .or_insert((1, now + Duration::seconds(ttl_seconds)));
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map_or(0, |(count, _)| *count))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(_, expires)| (*expires - now).num_seconds()))
    }
}

/// TTL-expiring blocklist with an injected clock.
pub struct MemoryBlockedIpStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, BlockedIpEntry>>,
}

impl MemoryBlockedIpStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BlockedIpEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl BlockedIpStore for MemoryBlockedIpStore {
    async fn put(&self, ip: &str, entry: BlockedIpEntry) -> Result<()> {
        self.lock().insert(ip.to_string(), entry);
        Ok(())
    }

    async fn get(&self, ip: &str) -> Result<Option<BlockedIpEntry>> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .get(ip)
            .filter(|entry| entry.blocked_until > now)
            .cloned())
    }

    async fn delete(&self, ip: &str) -> Result<()> {
        self.lock().remove(ip);
        Ok(())
    }
}

/// Bounded in-memory audit trail, newest first.
#[derive(Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

const AUDIT_CAPACITY: usize = 1000;

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        events.push(event);
        if events.len() > AUDIT_CAPACITY {
            let excess = events.len() - AUDIT_CAPACITY;
            events.drain(0..excess);
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn new_account(email: &str, username: &str) -> NewAccount {
        NewAccount {
            name: "Test".to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            avatar_url: None,
            email_verified_at: None,
            provider: None,
            provider_id: None,
            provider_token: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_account_attaches_default_role() {
        let store = MemoryStore::with_default_rbac();
        let outcome = store
            .create_account(new_account("a@x.com", "a"), "user")
            .await
            .unwrap();
        let InsertOutcome::Inserted(account) = outcome else {
            panic!("expected insert");
        };
        let roles = store.roles_of(account.id).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].slug, "user");

        let slugs: Vec<String> = store
            .effective_permissions(account.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.slug)
            .collect();
        assert!(slugs.contains(&"posts.create".to_string()));
        assert!(slugs.contains(&"posts.view".to_string()));
        assert!(!slugs.contains(&"users.delete".to_string()));
    }

    #[tokio::test]
    async fn duplicate_email_or_username_conflicts() {
        let store = MemoryStore::with_default_rbac();
        store
            .create_account(new_account("a@x.com", "a"), "user")
            .await
            .unwrap();
        assert!(matches!(
            store
                .create_account(new_account("A@X.com", "other"), "user")
                .await
                .unwrap(),
            InsertOutcome::Conflict
        ));
        assert!(matches!(
            store
                .create_account(new_account("b@x.com", "a"), "user")
                .await
                .unwrap(),
            InsertOutcome::Conflict
        ));
    }

    #[tokio::test]
    async fn failed_login_locks_at_threshold() {
        let store = MemoryStore::with_default_rbac();
        let InsertOutcome::Inserted(account) = store
            .create_account(new_account("a@x.com", "a"), "user")
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let lock_until = Utc::now() + Duration::minutes(30);
        for expected in 1..=4u32 {
            let count = store
                .record_failed_login(account.id, 5, lock_until)
                .await
                .unwrap();
            assert_eq!(count, expected);
            let account = store.find_by_id(account.id).await.unwrap().unwrap();
            assert!(account.locked_until.is_none());
        }
        let count = store
            .record_failed_login(account.id, 5, lock_until)
            .await
            .unwrap();
        assert_eq!(count, 5);
        let record = store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(record.locked_until, Some(lock_until));

        store.reset_login_failures(account.id).await.unwrap();
        let record = store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(record.failed_login_attempts, 0);
        assert!(record.locked_until.is_none());
    }

    #[tokio::test]
    async fn session_token_replaced_per_device_label() {
        let store = MemoryStore::with_default_rbac();
        let account_id = Uuid::new_v4();
        let now = Utc::now();
        let token = |hash: u8| TokenRecord {
            id: Uuid::new_v4(),
            account_id,
            kind: TokenKind::Session,
            label: "web".to_string(),
            abilities: vec!["posts.view".to_string()],
            token_hash: vec![hash],
            expires_at: None,
            created_at: now,
        };
        store.issue(token(1)).await.unwrap();
        store.issue(token(2)).await.unwrap();

        assert!(TokenStore::find_by_hash(&store, &[1]).await.unwrap().is_none());
        assert!(TokenStore::find_by_hash(&store, &[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_tokens_do_not_replace_each_other() {
        let store = MemoryStore::with_default_rbac();
        let account_id = Uuid::new_v4();
        let now = Utc::now();
        let token = |hash: u8| TokenRecord {
            id: Uuid::new_v4(),
            account_id,
            kind: TokenKind::PendingTwoFactor,
            label: "2fa-pending".to_string(),
            abilities: vec!["2fa-verify".to_string()],
            token_hash: vec![hash],
            expires_at: Some(now + Duration::minutes(10)),
            created_at: now,
        };
        store.issue(token(1)).await.unwrap();
        store.issue(token(2)).await.unwrap();
        assert!(TokenStore::find_by_hash(&store, &[1]).await.unwrap().is_some());
        assert!(TokenStore::find_by_hash(&store, &[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_roles_replaces_assignments() {
        let store = MemoryStore::with_default_rbac();
        let InsertOutcome::Inserted(account) = store
            .create_account(new_account("a@x.com", "a"), "user")
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let admin = store.find_role_by_slug("admin").await.unwrap().unwrap();
        store.sync_roles(account.id, &[admin.id]).await.unwrap();
        let roles = store.roles_of(account.id).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].slug, "admin");
    }

    #[tokio::test]
    async fn counter_decays_with_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let counters = MemoryCounterStore::new(clock.clone());

        assert_eq!(counters.incr("k", 60).await.unwrap(), 1);
        assert_eq!(counters.incr("k", 60).await.unwrap(), 2);
        assert_eq!(counters.get("k").await.unwrap(), 2);
        let ttl = counters.ttl_remaining("k").await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 60);

        clock.advance(Duration::seconds(61));
        assert_eq!(counters.get("k").await.unwrap(), 0);
        assert_eq!(counters.incr("k", 60).await.unwrap(), 1);

        counters.clear("k").await.unwrap();
        assert_eq!(counters.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocked_ip_entries_self_expire() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryBlockedIpStore::new(clock.clone());
        let now = clock.now();
        store
            .put(
                "1.2.3.4",
                BlockedIpEntry {
                    blocked_at: now,
                    blocked_until: now + Duration::hours(2),
                    reason: "Too many failed login attempts".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(store.get("1.2.3.4").await.unwrap().is_some());

        clock.advance(Duration::hours(2) + Duration::seconds(1));
        assert!(store.get("1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_store_returns_newest_first() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .record(AuditEvent::new(
                    "login_failed",
                    serde_json::json!({ "n": i }),
                    now,
                ))
                .await
                .unwrap();
        }
        let events = store.recent(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["n"], 2);
    }
}
