//! Role management, gated on `roles.manage`.

use axum::{
    Extension, Json,
    extract::Path,
    http::HeaderMap,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, created, ok, ok_empty};
use crate::api::handlers::require_permission;
use crate::api::types::{CreateRoleBody, PermissionIdsBody, PermissionView, RoleView, UpdateRoleBody};

const MANAGE: &str = "roles.manage";

#[utoipa::path(
    get,
    path = "/v1/admin/roles",
    responses(
        (status = 200, description = "All roles", body = Envelope),
        (status = 403, description = "Missing roles.manage", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let roles: Vec<RoleView> = state
        .rbac
        .list_roles()
        .await?
        .iter()
        .map(RoleView::from)
        .collect();
    Ok(ok("OK", json!({ "roles": roles })))
}

#[utoipa::path(
    post,
    path = "/v1/admin/roles",
    request_body = CreateRoleBody,
    responses(
        (status = 201, description = "Role created", body = Envelope),
        (status = 400, description = "Invalid slug", body = Envelope),
        (status = 409, description = "Slug already exists", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRoleBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let role = state
        .rbac
        .create_role(&body.slug, &body.name, body.description.as_deref())
        .await?;
    Ok(created("Role created", json!({ "role": RoleView::from(&role) })))
}

#[utoipa::path(
    get,
    path = "/v1/admin/roles/{id}",
    params(("id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role with its permissions", body = Envelope),
        (status = 404, description = "Unknown role", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn show(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let role = state.rbac.get_role(id).await?;
    let permissions: Vec<PermissionView> = state
        .rbac
        .role_permissions(id)
        .await?
        .iter()
        .map(PermissionView::from)
        .collect();
    Ok(ok(
        "OK",
        json!({ "role": RoleView::from(&role), "permissions": permissions }),
    ))
}

#[utoipa::path(
    put,
    path = "/v1/admin/roles/{id}",
    params(("id" = Uuid, Path, description = "Role id")),
    request_body = UpdateRoleBody,
    responses(
        (status = 200, description = "Role updated", body = Envelope),
        (status = 404, description = "Unknown role", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRoleBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let role = state
        .rbac
        .update_role(id, body.name.as_deref(), body.description.as_deref())
        .await?;
    Ok(ok("Role updated", json!({ "role": RoleView::from(&role) })))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/roles/{id}",
    params(("id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role deleted", body = Envelope),
        (status = 403, description = "Protected role", body = Envelope),
        (status = 404, description = "Unknown role", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn remove(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    state.rbac.delete_role(id).await?;
    Ok(ok_empty("Role deleted"))
}

#[utoipa::path(
    get,
    path = "/v1/admin/roles/{id}/permissions",
    params(("id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Permissions granted to the role", body = Envelope),
        (status = 404, description = "Unknown role", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn permissions(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let permissions: Vec<PermissionView> = state
        .rbac
        .role_permissions(id)
        .await?
        .iter()
        .map(PermissionView::from)
        .collect();
    Ok(ok("OK", json!({ "permissions": permissions })))
}

#[utoipa::path(
    put,
    path = "/v1/admin/roles/{id}/permissions",
    params(("id" = Uuid, Path, description = "Role id")),
    request_body = PermissionIdsBody,
    responses(
        (status = 200, description = "Role permissions replaced", body = Envelope),
        (status = 404, description = "Unknown role or permission id", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn set_permissions(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<PermissionIdsBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let permissions: Vec<PermissionView> = state
        .rbac
        .set_role_permissions(id, &body.permission_ids)
        .await?
        .iter()
        .map(PermissionView::from)
        .collect();
    Ok(ok(
        "Role permissions updated",
        json!({ "permissions": permissions }),
    ))
}
