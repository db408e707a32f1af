//! Social sign-in and account unlinking.

use axum::{
    Extension, Json,
    extract::ConnectInfo,
    http::HeaderMap,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok, ok_empty};
use crate::api::handlers::{
    SOCIAL_LOGIN_THROTTLE, client_ip, require_session, throttle_action,
};
use crate::api::types::{LoginData, SocialLoginBody};

#[utoipa::path(
    post,
    path = "/v1/auth/social/login",
    request_body = SocialLoginBody,
    responses(
        (status = 200, description = "Authenticated", body = Envelope),
        (status = 400, description = "Unsupported provider", body = Envelope),
        (status = 401, description = "Provider rejected the access token", body = Envelope),
        (status = 429, description = "Address blocked or sign-in budget exhausted", body = Envelope)
    ),
    tag = "social"
)]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SocialLoginBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &SOCIAL_LOGIN_THROTTLE, &ip).await?;
    let device = body
        .device_name
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| "web".to_string());
    let session = state
        .social
        .login(&body.provider, &body.access_token, &device, &ip)
        .await?;
    let mut response = ok("Login successful", LoginData::session(&session));
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    delete,
    path = "/v1/auth/social/link",
    responses(
        (status = 200, description = "Provider link removed", body = Envelope),
        (status = 400, description = "No social account is linked", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "social"
)]
pub async fn unlink(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    state.social.unlink(account.id).await?;
    Ok(ok_empty("Social account unlinked"))
}
