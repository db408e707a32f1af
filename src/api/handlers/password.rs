//! Password reset flow and authenticated password change.

use axum::{Extension, Json, extract::ConnectInfo, http::HeaderMap};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok_empty};
use crate::api::handlers::{
    PASSWORD_RESET_THROTTLE, PASSWORD_UPDATE_THROTTLE, client_ip, require_session, throttle_action,
};
use crate::api::types::{EmailBody, ResetPasswordBody, TokenBody, UpdatePasswordBody};

#[utoipa::path(
    post,
    path = "/v1/auth/password/forgot",
    request_body = EmailBody,
    responses(
        (status = 200, description = "Reset link sent if the address is registered", body = Envelope),
        (status = 429, description = "Resend cooldown active or reset budget exhausted", body = Envelope)
    ),
    tag = "password"
)]
pub async fn forgot(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<EmailBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &PASSWORD_RESET_THROTTLE, &ip).await?;
    state.password_reset.request(&body.email).await?;
    // Same reply whether or not the address exists.
    let mut response = ok_empty(
        "If that email address is registered, a reset link has been sent",
    );
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/password/validate",
    request_body = TokenBody,
    responses(
        (status = 200, description = "Token is valid", body = Envelope),
        (status = 400, description = "Token has expired", body = Envelope),
        (status = 404, description = "Unknown token", body = Envelope),
        (status = 429, description = "Reset budget exhausted for this address", body = Envelope)
    ),
    tag = "password"
)]
pub async fn validate(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TokenBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &PASSWORD_RESET_THROTTLE, &ip).await?;
    state.password_reset.validate(&body.token).await?;
    let mut response = ok_empty("Reset token is valid");
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/password/reset",
    request_body = ResetPasswordBody,
    responses(
        (status = 200, description = "Password reset; all sessions revoked", body = Envelope),
        (status = 400, description = "Expired token or weak password", body = Envelope),
        (status = 404, description = "Unknown token", body = Envelope),
        (status = 429, description = "Reset budget exhausted for this address", body = Envelope)
    ),
    tag = "password"
)]
pub async fn reset(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ResetPasswordBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &PASSWORD_RESET_THROTTLE, &ip).await?;
    state.password_reset.reset(&body.token, &body.password).await?;
    let mut response = ok_empty("Your password has been reset");
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    put,
    path = "/v1/auth/password",
    request_body = UpdatePasswordBody,
    responses(
        (status = 200, description = "Password changed; other sessions revoked", body = Envelope),
        (status = 400, description = "New password rejected by policy", body = Envelope),
        (status = 401, description = "Current password incorrect", body = Envelope),
        (status = 429, description = "Change budget exhausted for this account", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "password"
)]
pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdatePasswordBody>,
) -> ApiResult {
    let (record, account) = require_session(&state, &headers).await?;
    let budget =
        throttle_action(&state, &PASSWORD_UPDATE_THROTTLE, &account.id.to_string()).await?;
    state
        .auth
        .update_password(
            account.id,
            &body.current_password,
            &body.new_password,
            record.id,
        )
        .await?;
    let mut response = ok_empty("Password updated");
    budget.apply(&mut response);
    Ok(response)
}
