//! Email verification endpoints.

use axum::{Extension, Json, extract::ConnectInfo, http::HeaderMap};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok, ok_empty};
use crate::api::handlers::{
    EMAIL_RESEND_THROTTLE, EMAIL_VERIFY_THROTTLE, client_ip, throttle_action,
};
use crate::api::types::{AccountView, EmailBody, TokenBody};

#[utoipa::path(
    post,
    path = "/v1/auth/email/resend",
    request_body = EmailBody,
    responses(
        (status = 200, description = "Verification link sent if the address is registered", body = Envelope),
        (status = 400, description = "Address is already verified", body = Envelope),
        (status = 429, description = "Resend cooldown active or resend budget exhausted", body = Envelope)
    ),
    tag = "verification"
)]
pub async fn resend(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<EmailBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &EMAIL_RESEND_THROTTLE, &ip).await?;
    state.verification.send(&body.email).await?;
    let mut response = ok_empty(
        "If that email address is registered, a verification link has been sent",
    );
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/email/verify",
    request_body = TokenBody,
    responses(
        (status = 200, description = "Email address verified", body = Envelope),
        (status = 400, description = "Link has expired", body = Envelope),
        (status = 404, description = "Unknown link", body = Envelope),
        (status = 429, description = "Verification budget exhausted for this address", body = Envelope)
    ),
    tag = "verification"
)]
pub async fn verify(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TokenBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &EMAIL_VERIFY_THROTTLE, &ip).await?;
    let account = state.verification.consume(&body.token).await?;
    let mut response = ok(
        "Email address verified",
        json!({ "user": AccountView::from(&account) }),
    );
    budget.apply(&mut response);
    Ok(response)
}
