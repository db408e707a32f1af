//! Postgres backend.
//!
//! Raw queries over a shared pool; multi-write operations run in a single
//! transaction so a crash cannot leave an account without its default role or
//! two live session tokens for one device label.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    AccountRecord, AccountStore, AuditEvent, AuditStore, BlockedIpEntry, BlockedIpStore,
    CounterStore, EphemeralKind, EphemeralTokenRecord, EphemeralTokenStore, InsertOutcome,
    NewAccount, PermissionRecord, RbacStore, RoleRecord, TokenKind, TokenRecord, TokenStore,
};

/// SQLSTATE 23505.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> AccountRecord {
    let failed: i32 = row.get("failed_login_attempts");
    AccountRecord {
        id: row.get("id"),
        name: row.get("name"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        avatar_url: row.get("avatar_url"),
        is_active: row.get("is_active"),
        email_verified_at: row.get("email_verified_at"),
        failed_login_attempts: u32::try_from(failed).unwrap_or(0),
        locked_until: row.get("locked_until"),
        last_login_at: row.get("last_login_at"),
        last_login_ip: row.get("last_login_ip"),
        two_factor_enabled: row.get("two_factor_enabled"),
        two_factor_secret: row.get("two_factor_secret"),
        two_factor_recovery_codes: row.get("two_factor_recovery_codes"),
        provider: row.get("provider"),
        provider_id: row.get("provider_id"),
        provider_token: row.get("provider_token"),
        created_at: row.get("created_at"),
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, username, email, password_hash, avatar_url, is_active, \
     email_verified_at, failed_login_attempts, locked_until, last_login_at, last_login_ip, \
     two_factor_enabled, two_factor_secret, two_factor_recovery_codes, provider, provider_id, \
     provider_token, created_at";

async fn fetch_account(pool: &PgPool, clause: &str, bind: &str) -> Result<Option<AccountRecord>> {
    let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {clause}");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %query
    );
    let row = sqlx::query(&query)
        .bind(bind)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch account")?;
    Ok(row.as_ref().map(account_from_row))
}

#[async_trait::async_trait]
impl AccountStore for PgStore {
    async fn create_account(
        &self,
        new: NewAccount,
        default_role_slug: &str,
    ) -> Result<InsertOutcome<AccountRecord>> {
        let mut tx = self.pool.begin().await.context("begin signup transaction")?;

        let query = format!(
            r"
            INSERT INTO accounts
                (id, name, username, email, password_hash, avatar_url, email_verified_at,
                 provider, provider_id, provider_token, created_at)
            VALUES ($1, $2, $3, lower($4), $5, $6, $7, $8, $9, $10, $11)
            RETURNING {ACCOUNT_COLUMNS}
        "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&new.name)
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.password_hash)
            .bind(&new.avatar_url)
            .bind(new.email_verified_at)
            .bind(&new.provider)
            .bind(&new.provider_id)
            .bind(&new.provider_token)
            .bind(new.created_at)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await;

        let account = match row {
            Ok(row) => account_from_row(&row),
            Err(err) => {
                if is_unique_violation(&err) {
                    let _ = tx.rollback().await;
                    return Ok(InsertOutcome::Conflict);
                }
                return Err(err).context("failed to insert account");
            }
        };

        let query = r"
            INSERT INTO account_roles (account_id, role_id)
            SELECT $1, id FROM roles WHERE slug = $2
        ";
        let result = sqlx::query(query)
            .bind(account.id)
            .bind(default_role_slug)
            .execute(&mut *tx)
            .await
            .context("failed to attach default role")?;
        if result.rows_affected() == 0 {
            let _ = tx.rollback().await;
            anyhow::bail!("default role {default_role_slug} is not seeded");
        }

        tx.commit().await.context("commit signup transaction")?;
        Ok(InsertOutcome::Inserted(account))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch account by id")?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        fetch_account(&self.pool, "email = lower($1)", email).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<AccountRecord>> {
        fetch_account(&self.pool, "username = $1", username).await
    }

    async fn find_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<AccountRecord>> {
        let query =
            format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE provider = $1 AND provider_id = $2");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(provider)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch account by provider")?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<u32> {
        // Increment and lock in one statement so concurrent failures cannot
        // skip the threshold.
        let query = r"
            UPDATE accounts
            SET failed_login_attempts = failed_login_attempts + 1,
                locked_until = CASE
                    WHEN failed_login_attempts + 1 >= $2 THEN $3
                    ELSE locked_until
                END
            WHERE id = $1
            RETURNING failed_login_attempts
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .bind(i32::try_from(threshold).unwrap_or(i32::MAX))
            .bind(lock_until)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login failure")?;
        let count: i32 = row.get("failed_login_attempts");
        Ok(u32::try_from(count).unwrap_or(0))
    }

    async fn reset_login_failures(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE accounts SET failed_login_attempts = 0, locked_until = NULL WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to reset login failures")?;
        Ok(())
    }

    async fn record_login(&self, id: Uuid, ip: &str, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE accounts SET last_login_at = $2, last_login_ip = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .bind(ip)
            .execute(&self.pool)
            .await
            .context("failed to record login")?;
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let query = "UPDATE accounts SET password_hash = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .context("failed to update password hash")?;
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        let query = "UPDATE accounts SET is_active = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .context("failed to update active flag")?;
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE accounts SET email_verified_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("failed to mark email verified")?;
        Ok(())
    }

    async fn set_two_factor_setup(&self, id: Uuid, secret: &[u8], recovery: &[u8]) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET two_factor_secret = $2, two_factor_recovery_codes = $3
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(secret)
            .bind(recovery)
            .execute(&self.pool)
            .await
            .context("failed to store two-factor setup")?;
        Ok(())
    }

    async fn set_two_factor_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let query = "UPDATE accounts SET two_factor_enabled = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .context("failed to update two-factor flag")?;
        Ok(())
    }

    async fn set_recovery_codes(&self, id: Uuid, recovery: &[u8]) -> Result<()> {
        let query = "UPDATE accounts SET two_factor_recovery_codes = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(recovery)
            .execute(&self.pool)
            .await
            .context("failed to update recovery codes")?;
        Ok(())
    }

    async fn clear_two_factor(&self, id: Uuid) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET two_factor_enabled = FALSE,
                two_factor_secret = NULL,
                two_factor_recovery_codes = NULL
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to clear two-factor state")?;
        Ok(())
    }

    async fn link_provider(
        &self,
        id: Uuid,
        provider: &str,
        provider_id: &str,
        provider_token: Option<&[u8]>,
    ) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET provider = $2, provider_id = $3, provider_token = $4
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(provider)
            .bind(provider_id)
            .bind(provider_token)
            .execute(&self.pool)
            .await
            .context("failed to link provider")?;
        Ok(())
    }

    async fn unlink_provider(&self, id: Uuid) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET provider = NULL, provider_id = NULL, provider_token = NULL
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to unlink provider")?;
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        self.reset_login_failures(id).await
    }
}

fn role_from_row(row: &PgRow) -> RoleRecord {
    RoleRecord {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.get("description"),
    }
}

fn permission_from_row(row: &PgRow) -> PermissionRecord {
    PermissionRecord {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        category: row.get("category"),
    }
}

#[async_trait::async_trait]
impl RbacStore for PgStore {
    async fn list_roles(&self) -> Result<Vec<RoleRecord>> {
        let query = "SELECT id, slug, name, description FROM roles ORDER BY name";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .context("failed to list roles")?;
        Ok(rows.iter().map(role_from_row).collect())
    }

    async fn find_role_by_id(&self, id: Uuid) -> Result<Option<RoleRecord>> {
        let query = "SELECT id, slug, name, description FROM roles WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch role")?;
        Ok(row.as_ref().map(role_from_row))
    }

    async fn find_role_by_slug(&self, slug: &str) -> Result<Option<RoleRecord>> {
        let query = "SELECT id, slug, name, description FROM roles WHERE slug = $1";
        let row = sqlx::query(query)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch role by slug")?;
        Ok(row.as_ref().map(role_from_row))
    }

    async fn create_role(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<InsertOutcome<RoleRecord>> {
        let query = r"
            INSERT INTO roles (id, slug, name, description)
            VALUES ($1, $2, $3, $4)
            RETURNING id, slug, name, description
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(slug)
            .bind(name)
            .bind(description)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;
        match row {
            Ok(row) => Ok(InsertOutcome::Inserted(role_from_row(&row))),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert role"),
        }
    }

    async fn update_role(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<RoleRecord>> {
        let query = r"
            UPDATE roles
            SET name = COALESCE($2, name),
                description = COALESCE($3, description)
            WHERE id = $1
            RETURNING id, slug, name, description
        ";
        let row = sqlx::query(query)
            .bind(id)
            .bind(name)
            .bind(description)
            .fetch_optional(&self.pool)
            .await
            .context("failed to update role")?;
        Ok(row.as_ref().map(role_from_row))
    }

    async fn delete_role(&self, id: Uuid) -> Result<bool> {
        let query = "DELETE FROM roles WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete role")?;
        Ok(result.rows_affected() > 0)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<PermissionRecord>> {
        let query = r"
            SELECT p.id, p.slug, p.name, p.category
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            ORDER BY p.slug
        ";
        let rows = sqlx::query(query)
            .bind(role_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list role permissions")?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn set_role_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin role permission sync")?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await
            .context("failed to detach role permissions")?;
        let query = r"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, id FROM permissions WHERE id = ANY($2)
        ";
        sqlx::query(query)
            .bind(role_id)
            .bind(permission_ids)
            .execute(&mut *tx)
            .await
            .context("failed to attach role permissions")?;
        tx.commit().await.context("commit role permission sync")?;
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>> {
        let query = "SELECT id, slug, name, category FROM permissions ORDER BY slug";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .context("failed to list permissions")?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn find_permission_by_id(&self, id: Uuid) -> Result<Option<PermissionRecord>> {
        let query = "SELECT id, slug, name, category FROM permissions WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch permission")?;
        Ok(row.as_ref().map(permission_from_row))
    }

    async fn find_permissions_by_slugs(&self, slugs: &[String]) -> Result<Vec<PermissionRecord>> {
        let query = "SELECT id, slug, name, category FROM permissions WHERE slug = ANY($1)";
        let rows = sqlx::query(query)
            .bind(slugs)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch permissions by slug")?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn create_permission(
        &self,
        slug: &str,
        name: &str,
        category: &str,
    ) -> Result<InsertOutcome<PermissionRecord>> {
        let query = r"
            INSERT INTO permissions (id, slug, name, category)
            VALUES ($1, $2, $3, $4)
            RETURNING id, slug, name, category
        ";
        let row = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(slug)
            .bind(name)
            .bind(category)
            .fetch_one(&self.pool)
            .await;
        match row {
            Ok(row) => Ok(InsertOutcome::Inserted(permission_from_row(&row))),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert permission"),
        }
    }

    async fn update_permission(
        &self,
        id: Uuid,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<PermissionRecord>> {
        let query = r"
            UPDATE permissions
            SET name = COALESCE($2, name),
                category = COALESCE($3, category)
            WHERE id = $1
            RETURNING id, slug, name, category
        ";
        let row = sqlx::query(query)
            .bind(id)
            .bind(name)
            .bind(category)
            .fetch_optional(&self.pool)
            .await
            .context("failed to update permission")?;
        Ok(row.as_ref().map(permission_from_row))
    }

    async fn delete_permission(&self, id: Uuid) -> Result<bool> {
        let query = "DELETE FROM permissions WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete permission")?;
        Ok(result.rows_affected() > 0)
    }

    async fn roles_of(&self, account_id: Uuid) -> Result<Vec<RoleRecord>> {
        let query = r"
            SELECT r.id, r.slug, r.name, r.description
            FROM roles r
            JOIN account_roles ar ON ar.role_id = r.id
            WHERE ar.account_id = $1
            ORDER BY r.name
        ";
        let rows = sqlx::query(query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list account roles")?;
        Ok(rows.iter().map(role_from_row).collect())
    }

    async fn assign_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()> {
        let query = r"
            INSERT INTO account_roles (account_id, role_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(role_id)
            .execute(&self.pool)
            .await
            .context("failed to assign role")?;
        Ok(())
    }

    async fn remove_role(&self, account_id: Uuid, role_id: Uuid) -> Result<()> {
        let query = "DELETE FROM account_roles WHERE account_id = $1 AND role_id = $2";
        sqlx::query(query)
            .bind(account_id)
            .bind(role_id)
            .execute(&self.pool)
            .await
            .context("failed to remove role")?;
        Ok(())
    }

    async fn sync_roles(&self, account_id: Uuid, role_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin role sync")?;
        sqlx::query("DELETE FROM account_roles WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("failed to detach roles")?;
        let query = r"
            INSERT INTO account_roles (account_id, role_id)
            SELECT $1, id FROM roles WHERE id = ANY($2)
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(role_ids)
            .execute(&mut *tx)
            .await
            .context("failed to attach roles")?;
        tx.commit().await.context("commit role sync")?;
        Ok(())
    }

    async fn direct_permissions_of(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>> {
        let query = r"
            SELECT p.id, p.slug, p.name, p.category
            FROM permissions p
            JOIN account_permissions ap ON ap.permission_id = p.id
            WHERE ap.account_id = $1
            ORDER BY p.slug
        ";
        let rows = sqlx::query(query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list direct permissions")?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn grant_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let query = r"
            INSERT INTO account_permissions (account_id, permission_id)
            SELECT $1, id FROM permissions WHERE id = ANY($2)
            ON CONFLICT DO NOTHING
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(permission_ids)
            .execute(&self.pool)
            .await
            .context("failed to grant permissions")?;
        Ok(())
    }

    async fn revoke_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let query = r"
            DELETE FROM account_permissions
            WHERE account_id = $1 AND permission_id = ANY($2)
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(permission_ids)
            .execute(&self.pool)
            .await
            .context("failed to revoke permissions")?;
        Ok(())
    }

    async fn sync_permissions(&self, account_id: Uuid, permission_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin permission sync")?;
        sqlx::query("DELETE FROM account_permissions WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("failed to detach permissions")?;
        let query = r"
            INSERT INTO account_permissions (account_id, permission_id)
            SELECT $1, id FROM permissions WHERE id = ANY($2)
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(permission_ids)
            .execute(&mut *tx)
            .await
            .context("failed to attach permissions")?;
        tx.commit().await.context("commit permission sync")?;
        Ok(())
    }

    async fn effective_permissions(&self, account_id: Uuid) -> Result<Vec<PermissionRecord>> {
        // Union of role-derived and direct grants, deduplicated by id.
        let query = r"
            SELECT DISTINCT p.id, p.slug, p.name, p.category
            FROM permissions p
            WHERE p.id IN (
                SELECT rp.permission_id
                FROM role_permissions rp
                JOIN account_roles ar ON ar.role_id = rp.role_id
                WHERE ar.account_id = $1
                UNION
                SELECT ap.permission_id
                FROM account_permissions ap
                WHERE ap.account_id = $1
            )
            ORDER BY p.slug
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to resolve effective permissions")?;
        Ok(rows.iter().map(permission_from_row).collect())
    }
}

fn token_from_row(row: &PgRow) -> TokenRecord {
    let kind: String = row.get("kind");
    TokenRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        kind: TokenKind::parse(&kind),
        label: row.get("label"),
        abilities: row.get("abilities"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

#[async_trait::async_trait]
impl TokenStore for PgStore {
    async fn issue(&self, record: TokenRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin token issue")?;

        if record.kind == TokenKind::Session {
            let query = r"
                DELETE FROM tokens
                WHERE account_id = $1 AND kind = 'session' AND label = $2
            ";
            sqlx::query(query)
                .bind(record.account_id)
                .bind(&record.label)
                .execute(&mut *tx)
                .await
                .context("failed to revoke prior device token")?;
        }

        let query = r"
            INSERT INTO tokens
                (id, account_id, kind, label, abilities, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.id)
            .bind(record.account_id)
            .bind(record.kind.as_str())
            .bind(&record.label)
            .bind(&record.abilities)
            .bind(&record.token_hash)
            .bind(record.expires_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert token")?;

        tx.commit().await.context("commit token issue")?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<TokenRecord>> {
        let query = r"
            SELECT id, account_id, kind, label, abilities, token_hash, expires_at, created_at
            FROM tokens
            WHERE token_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch token")?;
        Ok(row.as_ref().map(token_from_row))
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete token")?;
        Ok(())
    }

    async fn delete_all_for_account(&self, account_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .context("failed to delete account tokens")?;
        Ok(result.rows_affected())
    }

    async fn delete_all_except(&self, account_id: Uuid, keep: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE account_id = $1 AND id <> $2")
            .bind(account_id)
            .bind(keep)
            .execute(&self.pool)
            .await
            .context("failed to delete other tokens")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM tokens WHERE expires_at IS NOT NULL AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .context("failed to purge expired tokens")?;
        Ok(result.rows_affected())
    }
}

fn ephemeral_from_row(row: &PgRow) -> EphemeralTokenRecord {
    let kind: String = row.get("kind");
    EphemeralTokenRecord {
        id: row.get("id"),
        kind: if kind == "password_reset" {
            EphemeralKind::PasswordReset
        } else {
            EphemeralKind::EmailVerify
        },
        owner_email: row.get("owner_email"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

#[async_trait::async_trait]
impl EphemeralTokenStore for PgStore {
    async fn replace_for_owner(&self, record: EphemeralTokenRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin token replace")?;
        sqlx::query("DELETE FROM ephemeral_tokens WHERE kind = $1 AND owner_email = $2")
            .bind(record.kind.as_str())
            .bind(&record.owner_email)
            .execute(&mut *tx)
            .await
            .context("failed to delete prior tokens")?;
        let query = r"
            INSERT INTO ephemeral_tokens
                (id, kind, owner_email, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(record.id)
            .bind(record.kind.as_str())
            .bind(&record.owner_email)
            .bind(&record.token_hash)
            .bind(record.expires_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .context("failed to insert ephemeral token")?;
        tx.commit().await.context("commit token replace")?;
        Ok(())
    }

    async fn find_by_hash(
        &self,
        kind: EphemeralKind,
        token_hash: &[u8],
    ) -> Result<Option<EphemeralTokenRecord>> {
        let query = r"
            SELECT id, kind, owner_email, token_hash, expires_at, created_at
            FROM ephemeral_tokens
            WHERE kind = $1 AND token_hash = $2
        ";
        let row = sqlx::query(query)
            .bind(kind.as_str())
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch ephemeral token")?;
        Ok(row.as_ref().map(ephemeral_from_row))
    }

    async fn latest_created_for_owner(
        &self,
        kind: EphemeralKind,
        owner_email: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = r"
            SELECT MAX(created_at) AS latest
            FROM ephemeral_tokens
            WHERE kind = $1 AND owner_email = $2
        ";
        let row = sqlx::query(query)
            .bind(kind.as_str())
            .bind(owner_email)
            .fetch_one(&self.pool)
            .await
            .context("failed to fetch latest token time")?;
        Ok(row.get("latest"))
    }

    async fn delete_all_for_owner(&self, kind: EphemeralKind, owner_email: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM ephemeral_tokens WHERE kind = $1 AND owner_email = $2")
                .bind(kind.as_str())
                .bind(owner_email)
                .execute(&self.pool)
                .await
                .context("failed to delete owner tokens")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ephemeral_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to purge expired tokens")?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl CounterStore for PgStore {
    async fn incr(&self, key: &str, ttl_seconds: i64) -> Result<u64> {
        // Upsert restarts the window when it has decayed; hits inside a live
        // window never extend it.
        let query = r"
            INSERT INTO rate_counters (key, count, expires_at)
            VALUES ($1, 1, NOW() + ($2 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE
            SET count = CASE
                    WHEN rate_counters.expires_at <= NOW() THEN 1
                    ELSE rate_counters.count + 1
                END,
                expires_at = CASE
                    WHEN rate_counters.expires_at <= NOW() THEN EXCLUDED.expires_at
                    ELSE rate_counters.expires_at
                END
            RETURNING count
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .bind(ttl_seconds)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment counter")?;
        let count: i64 = row.get("count");
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let query = "SELECT count FROM rate_counters WHERE key = $1 AND expires_at > NOW()";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read counter")?;
        Ok(row.map_or(0, |row| {
            let count: i64 = row.get("count");
            u64::try_from(count).unwrap_or(0)
        }))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_counters WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to clear counter")?;
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<i64>> {
        let query = r"
            SELECT CEIL(EXTRACT(EPOCH FROM (expires_at - NOW())))::bigint AS ttl
            FROM rate_counters
            WHERE key = $1 AND expires_at > NOW()
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read counter ttl")?;
        Ok(row.map(|row| row.get("ttl")))
    }
}

#[async_trait::async_trait]
impl BlockedIpStore for PgStore {
    async fn put(&self, ip: &str, entry: BlockedIpEntry) -> Result<()> {
        let query = r"
            INSERT INTO blocked_ips (ip, blocked_at, blocked_until, reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip) DO UPDATE
            SET blocked_at = EXCLUDED.blocked_at,
                blocked_until = EXCLUDED.blocked_until,
                reason = EXCLUDED.reason
        ";
        sqlx::query(query)
            .bind(ip)
            .bind(entry.blocked_at)
            .bind(entry.blocked_until)
            .bind(&entry.reason)
            .execute(&self.pool)
            .await
            .context("failed to store blocked ip")?;
        Ok(())
    }

    async fn get(&self, ip: &str) -> Result<Option<BlockedIpEntry>> {
        let query = r"
            SELECT blocked_at, blocked_until, reason
            FROM blocked_ips
            WHERE ip = $1 AND blocked_until > NOW()
        ";
        let row = sqlx::query(query)
            .bind(ip)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read blocked ip")?;
        Ok(row.map(|row| BlockedIpEntry {
            blocked_at: row.get("blocked_at"),
            blocked_until: row.get("blocked_until"),
            reason: row.get("reason"),
        }))
    }

    async fn delete(&self, ip: &str) -> Result<()> {
        sqlx::query("DELETE FROM blocked_ips WHERE ip = $1")
            .bind(ip)
            .execute(&self.pool)
            .await
            .context("failed to unblock ip")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditStore for PgStore {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        let query = r"
            INSERT INTO security_events (id, kind, payload, recorded_at)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(event.id)
            .bind(&event.kind)
            .bind(&event.payload)
            .bind(event.recorded_at)
            .execute(&self.pool)
            .await
            .context("failed to record security event")?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let query = r"
            SELECT id, kind, payload, recorded_at
            FROM security_events
            ORDER BY recorded_at DESC
            LIMIT $1
        ";
        let rows = sqlx::query(query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("failed to list security events")?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let payload: Value = row.get("payload");
                AuditEvent {
                    id: row.get("id"),
                    kind: row.get("kind"),
                    payload,
                    recorded_at: row.get("recorded_at"),
                }
            })
            .collect())
    }
}
