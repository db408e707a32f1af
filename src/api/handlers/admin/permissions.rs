//! Permission catalog management, gated on `permissions.manage`.

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
use crate::api::types::{CreatePermissionBody, PermissionView, UpdatePermissionBody};

const MANAGE: &str = "permissions.manage";

#[utoipa::path(
    get,
    path = "/v1/admin/permissions",
    responses(
        (status = 200, description = "Catalog grouped by category", body = Envelope),
        (status = 403, description = "Missing permissions.manage", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let grouped = state.rbac.permissions_by_category().await?;
    let categories: serde_json::Map<String, serde_json::Value> = grouped
        .into_iter()
        .map(|(category, permissions)| {
            let views: Vec<PermissionView> = permissions.iter().map(PermissionView::from).collect();
            (category, json!(views))
        })
        .collect();
    Ok(ok("OK", json!({ "permissions": categories })))
}

#[utoipa::path(
    post,
    path = "/v1/admin/permissions",
    request_body = CreatePermissionBody,
    responses(
        (status = 201, description = "Permission created", body = Envelope),
        (status = 400, description = "Invalid slug", body = Envelope),
        (status = 409, description = "Slug already exists", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreatePermissionBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let permission = state
        .rbac
        .create_permission(&body.slug, &body.name, &body.category)
        .await?;
    Ok(created(
        "Permission created",
        json!({ "permission": PermissionView::from(&permission) }),
    ))
}

#[utoipa::path(
    put,
    path = "/v1/admin/permissions/{id}",
    params(("id" = Uuid, Path, description = "Permission id")),
    request_body = UpdatePermissionBody,
    responses(
        (status = 200, description = "Permission updated", body = Envelope),
        (status = 404, description = "Unknown permission", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePermissionBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let permission = state
        .rbac
        .update_permission(id, body.name.as_deref(), body.category.as_deref())
        .await?;
    Ok(ok(
        "Permission updated",
        json!({ "permission": PermissionView::from(&permission) }),
    ))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/permissions/{id}",
    params(("id" = Uuid, Path, description = "Permission id")),
    responses(
        (status = 200, description = "Permission deleted and detached everywhere", body = Envelope),
        (status = 404, description = "Unknown permission", body = Envelope)
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
    state.rbac.delete_permission(id).await?;
    Ok(ok_empty("Permission deleted"))
}
