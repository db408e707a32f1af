//! Wire types: request bodies and response views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::{AccountRecord, AuditEvent, BlockedIpEntry, PermissionRecord, RoleRecord};
use crate::totp::TwoFactorSetup;

// --- requests ---

#[derive(Deserialize, ToSchema)]
pub struct RegisterBody {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginBody {
    /// Email address or username.
    pub identifier: String,
    pub password: String,
    /// Device label for the issued token; defaults to `web`.
    pub device_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct TwoFactorVerifyBody {
    pub pending_token: String,
    /// TOTP code or recovery code.
    pub code: String,
    pub device_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdatePasswordBody {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct EmailBody {
    pub email: String,
}

#[derive(Deserialize, ToSchema)]
pub struct TokenBody {
    pub token: String,
}

#[derive(Deserialize, ToSchema)]
pub struct ResetPasswordBody {
    pub token: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct CodeBody {
    pub code: String,
}

#[derive(Deserialize, ToSchema)]
pub struct PasswordBody {
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct SocialLoginBody {
    /// One of `google`, `github`, `facebook`.
    pub provider: String,
    pub access_token: String,
    pub device_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct CheckPermissionsBody {
    pub permissions: Vec<String>,
    /// When true, every listed permission must be held; otherwise any one
    /// suffices.
    #[serde(default)]
    pub require_all: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateRoleBody {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateRoleBody {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreatePermissionBody {
    pub slug: String,
    pub name: String,
    pub category: String,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdatePermissionBody {
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct PermissionIdsBody {
    pub permission_ids: Vec<Uuid>,
}

#[derive(Deserialize, ToSchema)]
pub struct RoleIdsBody {
    pub role_ids: Vec<Uuid>,
}

#[derive(Deserialize, ToSchema)]
pub struct BlockIpBody {
    pub ip: String,
    /// Block duration; defaults to 120 minutes.
    pub minutes: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct IpBody {
    pub ip: String,
}

// --- views ---

#[derive(Serialize, ToSchema)]
pub struct AccountView {
    pub id: Uuid,
    pub name: String,
    pub username: String,
    pub email: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub two_factor_enabled: bool,
    pub provider: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&AccountRecord> for AccountView {
    fn from(record: &AccountRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            username: record.username.clone(),
            email: record.email.clone(),
            avatar_url: record.avatar_url.clone(),
            is_active: record.is_active,
            email_verified: record.email_verified(),
            two_factor_enabled: record.two_factor_enabled,
            provider: record.provider.clone(),
            last_login_at: record.last_login_at,
            created_at: record.created_at,
        }
    }
}

/// Payload for login and 2FA verification responses. Exactly one of the
/// token/pending pair is populated.
#[derive(Serialize, ToSchema)]
pub struct LoginData {
    pub requires_two_factor: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AccountView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_token: Option<String>,
}

impl LoginData {
    #[must_use]
    pub fn session(session: &crate::auth::Session) -> Self {
        Self {
            requires_two_factor: false,
            token: Some(session.token.clone()),
            abilities: Some(session.abilities.clone()),
            user: Some(AccountView::from(&session.account)),
            pending_token: None,
        }
    }

    #[must_use]
    pub fn pending(pending_token: String) -> Self {
        Self {
            requires_two_factor: true,
            token: None,
            abilities: None,
            user: None,
            pending_token: Some(pending_token),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct RoleView {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

impl From<&RoleRecord> for RoleView {
    fn from(record: &RoleRecord) -> Self {
        Self {
            id: record.id,
            slug: record.slug.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PermissionView {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub category: String,
}

impl From<&PermissionRecord> for PermissionView {
    fn from(record: &PermissionRecord) -> Self {
        Self {
            id: record.id,
            slug: record.slug.clone(),
            name: record.name.clone(),
            category: record.category.clone(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct TwoFactorSetupView {
    pub secret: String,
    pub otpauth_url: String,
    /// Shown exactly once; not retrievable afterwards.
    pub recovery_codes: Vec<String>,
}

impl From<TwoFactorSetup> for TwoFactorSetupView {
    fn from(setup: TwoFactorSetup) -> Self {
        Self {
            secret: setup.secret,
            otpauth_url: setup.otpauth_url,
            recovery_codes: setup.recovery_codes,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct BlockedIpView {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
    pub reason: String,
}

impl BlockedIpView {
    #[must_use]
    pub fn from_entry(ip: &str, entry: &BlockedIpEntry) -> Self {
        Self {
            ip: ip.to_string(),
            blocked_at: entry.blocked_at,
            blocked_until: entry.blocked_until,
            reason: entry.reason.clone(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AuditEventView {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl From<&AuditEvent> for AuditEventView {
    fn from(event: &AuditEvent) -> Self {
        Self {
            id: event.id,
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            recorded_at: event.recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_data_shapes_are_mutually_exclusive() {
        let pending = LoginData::pending("tok".to_string());
        assert!(pending.requires_two_factor);
        assert!(pending.token.is_none());

        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["requires_two_factor"], true);
        assert_eq!(json["pending_token"], "tok");
        assert!(json.get("token").is_none());
        assert!(json.get("user").is_none());
    }
}
