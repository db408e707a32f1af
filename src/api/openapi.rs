//! OpenAPI document, assembled from the `#[utoipa::path]` annotations on the
//! handlers and served at `/openapi.json`.

use axum::Json;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::envelope::Envelope;
use crate::api::handlers;
use crate::api::types::{
    AccountView, AuditEventView, BlockIpBody, BlockedIpView, CheckPermissionsBody, CodeBody,
    CreatePermissionBody, CreateRoleBody, EmailBody, IpBody, LoginBody, LoginData, PasswordBody,
    PermissionIdsBody, PermissionView, RegisterBody, ResetPasswordBody, RoleIdsBody, RoleView,
    SocialLoginBody, TokenBody, TwoFactorSetupView, TwoFactorVerifyBody, UpdatePasswordBody,
    UpdatePermissionBody, UpdateRoleBody,
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::verify_two_factor,
        handlers::auth::logout,
        handlers::auth::logout_all,
        handlers::auth::me,
        handlers::password::forgot,
        handlers::password::validate,
        handlers::password::reset,
        handlers::password::update,
        handlers::verification::resend,
        handlers::verification::verify,
        handlers::two_factor::enable,
        handlers::two_factor::confirm,
        handlers::two_factor::disable,
        handlers::two_factor::regenerate_recovery_codes,
        handlers::social::login,
        handlers::social::unlink,
        handlers::permissions::mine,
        handlers::permissions::check,
        handlers::admin::roles::list,
        handlers::admin::roles::create,
        handlers::admin::roles::show,
        handlers::admin::roles::update,
        handlers::admin::roles::remove,
        handlers::admin::roles::permissions,
        handlers::admin::roles::set_permissions,
        handlers::admin::permissions::list,
        handlers::admin::permissions::create,
        handlers::admin::permissions::update,
        handlers::admin::permissions::remove,
        handlers::admin::users::roles,
        handlers::admin::users::sync_roles,
        handlers::admin::users::direct_permissions,
        handlers::admin::users::sync_permissions,
        handlers::admin::users::unlock,
        handlers::admin::security::block_ip,
        handlers::admin::security::unblock_ip,
        handlers::admin::security::blocked_ip,
        handlers::admin::security::events,
    ),
    components(schemas(
        Envelope,
        handlers::health::Health,
        RegisterBody,
        LoginBody,
        TwoFactorVerifyBody,
        UpdatePasswordBody,
        EmailBody,
        TokenBody,
        ResetPasswordBody,
        CodeBody,
        PasswordBody,
        SocialLoginBody,
        CheckPermissionsBody,
        CreateRoleBody,
        UpdateRoleBody,
        CreatePermissionBody,
        UpdatePermissionBody,
        PermissionIdsBody,
        RoleIdsBody,
        BlockIpBody,
        IpBody,
        AccountView,
        LoginData,
        RoleView,
        PermissionView,
        TwoFactorSetupView,
        BlockedIpView,
        AuditEventView,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "health", description = "Liveness"),
        (name = "auth", description = "Registration, login, and sessions"),
        (name = "password", description = "Password reset and change"),
        (name = "verification", description = "Email verification"),
        (name = "two-factor", description = "TOTP enrollment and recovery codes"),
        (name = "social", description = "Social sign-in"),
        (name = "permissions", description = "Permission introspection"),
        (name = "admin", description = "Role, permission, and security administration"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi())
}
