//! Per-account access management.

use axum::{
    Extension, Json,
    extract::Path,
    http::HeaderMap,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok, ok_empty};
use crate::api::handlers::require_permission;
use crate::api::types::{PermissionIdsBody, PermissionView, RoleIdsBody, RoleView};

#[utoipa::path(
    get,
    path = "/v1/admin/users/{id}/roles",
    params(("id" = Uuid, Path, description = "Account id")),
    responses(
        (status = 200, description = "Roles assigned to the account", body = Envelope),
        (status = 403, description = "Missing users.view", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn roles(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, "users.view").await?;
    let roles: Vec<RoleView> = state
        .rbac
        .roles_of(id)
        .await?
        .iter()
        .map(RoleView::from)
        .collect();
    Ok(ok("OK", json!({ "roles": roles })))
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}/roles",
    params(("id" = Uuid, Path, description = "Account id")),
    request_body = RoleIdsBody,
    responses(
        (status = 200, description = "Roles replaced; empty list falls back to the default role", body = Envelope),
        (status = 404, description = "Unknown role id", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn sync_roles(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<RoleIdsBody>,
) -> ApiResult {
    require_permission(&state, &headers, "users.edit").await?;
    let roles: Vec<RoleView> = state
        .rbac
        .sync_roles(id, &body.role_ids)
        .await?
        .iter()
        .map(RoleView::from)
        .collect();
    Ok(ok("Roles updated", json!({ "roles": roles })))
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/{id}/permissions",
    params(("id" = Uuid, Path, description = "Account id")),
    responses(
        (status = 200, description = "Direct permission grants, outside any role", body = Envelope),
        (status = 403, description = "Missing users.view", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn direct_permissions(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, "users.view").await?;
    let permissions: Vec<PermissionView> = state
        .rbac
        .direct_permissions_of(id)
        .await?
        .iter()
        .map(PermissionView::from)
        .collect();
    Ok(ok("OK", json!({ "permissions": permissions })))
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}/permissions",
    params(("id" = Uuid, Path, description = "Account id")),
    request_body = PermissionIdsBody,
    responses(
        (status = 200, description = "Direct grants replaced", body = Envelope),
        (status = 404, description = "Unknown permission id", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn sync_permissions(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<PermissionIdsBody>,
) -> ApiResult {
    require_permission(&state, &headers, "users.edit").await?;
    let permissions: Vec<PermissionView> = state
        .rbac
        .sync_permissions(id, &body.permission_ids)
        .await?
        .iter()
        .map(PermissionView::from)
        .collect();
    Ok(ok("Permissions updated", json!({ "permissions": permissions })))
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/unlock",
    params(("id" = Uuid, Path, description = "Account id")),
    responses(
        (status = 200, description = "Failed-login lock cleared", body = Envelope),
        (status = 404, description = "Unknown account", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn unlock(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, "users.edit").await?;
    state.auth.clear_lockout(id).await?;
    Ok(ok_empty("Account unlocked"))
}
