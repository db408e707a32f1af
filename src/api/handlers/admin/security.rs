//! Address blocking and the security event feed.

use axum::{
    Extension, Json,
    extract::{Path, Query},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok, ok_empty};
use crate::api::handlers::require_permission;
use crate::api::types::{AuditEventView, BlockIpBody, BlockedIpView, IpBody};
use crate::error::AuthError;
use crate::ratelimit::ip_block::AUTO_BLOCK_MINUTES;

const MANAGE: &str = "users.edit";
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
}

#[utoipa::path(
    post,
    path = "/v1/admin/security/block",
    request_body = BlockIpBody,
    responses(
        (status = 200, description = "Address blocked", body = Envelope),
        (status = 400, description = "Invalid address or duration", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn block_ip(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BlockIpBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let ip = body.ip.trim();
    if ip.is_empty() {
        return Err(AuthError::Validation("An IP address is required".to_string()).into());
    }
    let minutes = body.minutes.unwrap_or(AUTO_BLOCK_MINUTES);
    if minutes <= 0 {
        return Err(
            AuthError::Validation("Block duration must be positive".to_string()).into(),
        );
    }
    let reason = body.reason.unwrap_or_else(|| "Blocked by administrator".to_string());
    state.blocklist.block(ip, minutes, &reason).await?;
    Ok(ok_empty("Address blocked"))
}

#[utoipa::path(
    post,
    path = "/v1/admin/security/unblock",
    request_body = IpBody,
    responses(
        (status = 200, description = "Address unblocked; a no-op if it was not blocked", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn unblock_ip(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IpBody>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    state.blocklist.unblock(body.ip.trim()).await?;
    Ok(ok_empty("Address unblocked"))
}

#[utoipa::path(
    get,
    path = "/v1/admin/security/blocked/{ip}",
    params(("ip" = String, Path, description = "IP address")),
    responses(
        (status = 200, description = "Block entry", body = Envelope),
        (status = 404, description = "Address is not blocked", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn blocked_ip(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let entry = state
        .blocklist
        .info(&ip)
        .await?
        .ok_or_else(|| AuthError::NotFound("Address is not blocked".to_string()))?;
    Ok(ok(
        "OK",
        json!({ "block": BlockedIpView::from_entry(&ip, &entry) }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/admin/security/events",
    params(("limit" = Option<usize>, Query, description = "Number of events, newest first")),
    responses(
        (status = 200, description = "Recent security events", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn events(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    require_permission(&state, &headers, MANAGE).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    let events: Vec<AuditEventView> = state
        .audit
        .recent(limit)
        .await?
        .iter()
        .map(AuditEventView::from)
        .collect();
    Ok(ok("OK", json!({ "events": events })))
}
