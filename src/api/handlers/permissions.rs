//! Permission introspection for the authenticated account.

use axum::{Extension, Json, http::HeaderMap};
use serde_json::json;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok};
use crate::api::handlers::require_session;
use crate::api::types::CheckPermissionsBody;
use crate::error::AuthError;

#[utoipa::path(
    get,
    path = "/v1/permissions/mine",
    responses(
        (status = 200, description = "Effective permissions grouped by category", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "permissions"
)]
pub async fn mine(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    let effective = state.rbac.effective_permissions(account.id).await?;

    let mut grouped = std::collections::BTreeMap::<String, Vec<String>>::new();
    for permission in effective {
        grouped
            .entry(permission.category)
            .or_default()
            .push(permission.slug);
    }
    Ok(ok("OK", json!({ "permissions": grouped })))
}

#[utoipa::path(
    post,
    path = "/v1/permissions/check",
    request_body = CheckPermissionsBody,
    responses(
        (status = 200, description = "Check result, with the verdict per slug", body = Envelope),
        (status = 400, description = "No permissions listed", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "permissions"
)]
pub async fn check(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CheckPermissionsBody>,
) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    if body.permissions.is_empty() {
        return Err(AuthError::Validation(
            "At least one permission is required".to_string(),
        )
        .into());
    }

    let mut verdicts = serde_json::Map::new();
    let mut granted_count = 0usize;
    for slug in &body.permissions {
        let granted = state.rbac.has_permission(account.id, slug).await?;
        if granted {
            granted_count += 1;
        }
        verdicts.insert(slug.clone(), json!(granted));
    }
    let allowed = if body.require_all {
        granted_count == body.permissions.len()
    } else {
        granted_count > 0
    };

    Ok(ok(
        "OK",
        json!({ "allowed": allowed, "results": verdicts }),
    ))
}
