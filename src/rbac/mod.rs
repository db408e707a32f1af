//! Role and permission management plus access resolution.
//!
//! An account's effective permissions are the union of its role grants and
//! direct grants. Checks run through the wildcard matcher, so a role holding
//! `*` or `posts.*` covers requirements it never names literally.

use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::store::{InsertOutcome, PermissionRecord, RbacStore, RoleRecord};

pub mod matcher;

/// Role attached to every fresh account, and re-attached whenever a sync
/// would leave an account with no role at all.
pub const DEFAULT_ROLE: &str = "user";

/// Roles the engine depends on; they cannot be deleted.
pub const PROTECTED_ROLES: [&str; 3] = ["admin", "moderator", "user"];

fn is_valid_slug(slug: &str) -> bool {
    if slug == "*" {
        return true;
    }
    // A wildcard is only meaningful standalone or as a trailing `.*`; any
    // other placement would be storable but never match.
    let literal = slug.strip_suffix(".*").unwrap_or(slug);
    !literal.is_empty()
        && !literal.starts_with('.')
        && !literal.ends_with('.')
        && literal
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
}

#[derive(Clone)]
pub struct RbacService {
    store: Arc<dyn RbacStore>,
}

impl RbacService {
    #[must_use]
    pub fn new(store: Arc<dyn RbacStore>) -> Self {
        Self { store }
    }

    // --- resolution ---

    /// Effective permission records: role grants plus direct grants, deduplicated.
    pub async fn effective_permissions(&self, account_id: Uuid) -> AuthResult<Vec<PermissionRecord>> {
        Ok(self.store.effective_permissions(account_id).await?)
    }

    pub async fn effective_slugs(&self, account_id: Uuid) -> AuthResult<Vec<String>> {
        Ok(self
            .store
            .effective_permissions(account_id)
            .await?
            .into_iter()
            .map(|p| p.slug)
            .collect())
    }

    /// Whether the account satisfies `required` via any granted slug.
    pub async fn has_permission(&self, account_id: Uuid, required: &str) -> AuthResult<bool> {
        let slugs = self.effective_slugs(account_id).await?;
        Ok(matcher::any_matches(slugs.iter().map(String::as_str), required))
    }

    pub async fn has_any_permission(
        &self,
        account_id: Uuid,
        required: &[String],
    ) -> AuthResult<bool> {
        let slugs = self.effective_slugs(account_id).await?;
        Ok(required
            .iter()
            .any(|req| matcher::any_matches(slugs.iter().map(String::as_str), req)))
    }

    pub async fn has_all_permissions(
        &self,
        account_id: Uuid,
        required: &[String],
    ) -> AuthResult<bool> {
        let slugs = self.effective_slugs(account_id).await?;
        Ok(required
            .iter()
            .all(|req| matcher::any_matches(slugs.iter().map(String::as_str), req)))
    }

    pub async fn roles_of(&self, account_id: Uuid) -> AuthResult<Vec<RoleRecord>> {
        Ok(self.store.roles_of(account_id).await?)
    }

    pub async fn direct_permissions_of(
        &self,
        account_id: Uuid,
    ) -> AuthResult<Vec<PermissionRecord>> {
        Ok(self.store.direct_permissions_of(account_id).await?)
    }

    // --- role management ---

    pub async fn list_roles(&self) -> AuthResult<Vec<RoleRecord>> {
        Ok(self.store.list_roles().await?)
    }

    pub async fn get_role(&self, id: Uuid) -> AuthResult<RoleRecord> {
        self.store
            .find_role_by_id(id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Role not found".to_string()))
    }

    pub async fn create_role(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
    ) -> AuthResult<RoleRecord> {
        if !is_valid_slug(slug) || slug == "*" {
            return Err(AuthError::Validation(format!("Invalid role slug: {slug}")));
        }
        if name.trim().is_empty() {
            return Err(AuthError::Validation("Role name is required".to_string()));
        }
        match self.store.create_role(slug, name, description).await? {
            InsertOutcome::Inserted(role) => Ok(role),
            InsertOutcome::Conflict => Err(AuthError::Conflict(format!(
                "A role with slug {slug} already exists"
            ))),
        }
    }

    pub async fn update_role(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> AuthResult<RoleRecord> {
        if name.is_some_and(|n| n.trim().is_empty()) {
            return Err(AuthError::Validation("Role name cannot be empty".to_string()));
        }
        self.store
            .update_role(id, name, description)
            .await?
            .ok_or_else(|| AuthError::NotFound("Role not found".to_string()))
    }

    pub async fn delete_role(&self, id: Uuid) -> AuthResult<()> {
        let role = self.get_role(id).await?;
        if PROTECTED_ROLES.contains(&role.slug.as_str()) {
            return Err(AuthError::Forbidden(format!(
                "The {} role is protected and cannot be deleted",
                role.slug
            )));
        }
        if !self.store.delete_role(id).await? {
            return Err(AuthError::NotFound("Role not found".to_string()));
        }
        Ok(())
    }

    pub async fn role_permissions(&self, role_id: Uuid) -> AuthResult<Vec<PermissionRecord>> {
        self.get_role(role_id).await?;
        Ok(self.store.role_permissions(role_id).await?)
    }

    /// Replace a role's permission set. Unknown ids are rejected rather than
    /// silently dropped.
    pub async fn set_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> AuthResult<Vec<PermissionRecord>> {
        self.get_role(role_id).await?;
        for id in permission_ids {
            if self.store.find_permission_by_id(*id).await?.is_none() {
                return Err(AuthError::NotFound(format!("Permission {id} not found")));
            }
        }
        self.store.set_role_permissions(role_id, permission_ids).await?;
        Ok(self.store.role_permissions(role_id).await?)
    }

    // --- permission management ---

    pub async fn list_permissions(&self) -> AuthResult<Vec<PermissionRecord>> {
        Ok(self.store.list_permissions().await?)
    }

    /// Permissions grouped by category, ordered by category name.
    pub async fn permissions_by_category(
        &self,
    ) -> AuthResult<BTreeMap<String, Vec<PermissionRecord>>> {
        let mut grouped: BTreeMap<String, Vec<PermissionRecord>> = BTreeMap::new();
        for permission in self.store.list_permissions().await? {
            grouped
                .entry(permission.category.clone())
                .or_default()
                .push(permission);
        }
        Ok(grouped)
    }

    pub async fn get_permission(&self, id: Uuid) -> AuthResult<PermissionRecord> {
        self.store
            .find_permission_by_id(id)
            .await?
            .ok_or_else(|| AuthError::NotFound("Permission not found".to_string()))
    }

    pub async fn create_permission(
        &self,
        slug: &str,
        name: &str,
        category: &str,
    ) -> AuthResult<PermissionRecord> {
        if !is_valid_slug(slug) {
            return Err(AuthError::Validation(format!(
                "Invalid permission slug: {slug}"
            )));
        }
        if name.trim().is_empty() {
            return Err(AuthError::Validation(
                "Permission name is required".to_string(),
            ));
        }
        match self.store.create_permission(slug, name, category).await? {
            InsertOutcome::Inserted(permission) => Ok(permission),
            InsertOutcome::Conflict => Err(AuthError::Conflict(format!(
                "A permission with slug {slug} already exists"
            ))),
        }
    }

    pub async fn update_permission(
        &self,
        id: Uuid,
        name: Option<&str>,
        category: Option<&str>,
    ) -> AuthResult<PermissionRecord> {
        self.store
            .update_permission(id, name, category)
            .await?
            .ok_or_else(|| AuthError::NotFound("Permission not found".to_string()))
    }

    pub async fn delete_permission(&self, id: Uuid) -> AuthResult<()> {
        if !self.store.delete_permission(id).await? {
            return Err(AuthError::NotFound("Permission not found".to_string()));
        }
        Ok(())
    }

    // --- account assignment ---

    pub async fn assign_role(&self, account_id: Uuid, role_id: Uuid) -> AuthResult<()> {
        self.get_role(role_id).await?;
        Ok(self.store.assign_role(account_id, role_id).await?)
    }

    pub async fn remove_role(&self, account_id: Uuid, role_id: Uuid) -> AuthResult<()> {
        Ok(self.store.remove_role(account_id, role_id).await?)
    }

    /// Replace the account's role set. An empty set falls back to the default
    /// role so no account is ever left role-less.
    pub async fn sync_roles(&self, account_id: Uuid, role_ids: &[Uuid]) -> AuthResult<Vec<RoleRecord>> {
        let mut valid = Vec::with_capacity(role_ids.len());
        for id in role_ids {
            if self.store.find_role_by_id(*id).await?.is_some() {
                valid.push(*id);
            } else {
                return Err(AuthError::NotFound(format!("Role {id} not found")));
            }
        }
        if valid.is_empty() {
            let default = self
                .store
                .find_role_by_slug(DEFAULT_ROLE)
                .await?
                .ok_or_else(|| {
                    AuthError::Internal(anyhow::anyhow!("default role {DEFAULT_ROLE} is not seeded"))
                })?;
            valid.push(default.id);
        }
        self.store.sync_roles(account_id, &valid).await?;
        Ok(self.store.roles_of(account_id).await?)
    }

    pub async fn grant_permissions(
        &self,
        account_id: Uuid,
        permission_ids: &[Uuid],
    ) -> AuthResult<()> {
        for id in permission_ids {
            self.get_permission(*id).await?;
        }
        Ok(self.store.grant_permissions(account_id, permission_ids).await?)
    }

    pub async fn revoke_permissions(
        &self,
        account_id: Uuid,
        permission_ids: &[Uuid],
    ) -> AuthResult<()> {
        Ok(self
            .store
            .revoke_permissions(account_id, permission_ids)
            .await?)
    }

    pub async fn sync_permissions(
        &self,
        account_id: Uuid,
        permission_ids: &[Uuid],
    ) -> AuthResult<Vec<PermissionRecord>> {
        for id in permission_ids {
            self.get_permission(*id).await?;
        }
        self.store.sync_permissions(account_id, permission_ids).await?;
        Ok(self.store.direct_permissions_of(account_id).await?)
    }
}
