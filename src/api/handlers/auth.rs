//! Registration, login, two-factor verification, and session endpoints.

use axum::{Extension, Json, extract::ConnectInfo, http::HeaderMap};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, created, ok, ok_empty};
use crate::api::handlers::{
    REGISTER_THROTTLE, RateLimitHeaders, TWO_FACTOR_LOGIN_THROTTLE, client_ip, require_session,
    throttle_action,
};
use crate::api::types::{AccountView, LoginBody, LoginData, RegisterBody, TwoFactorVerifyBody};
use crate::auth::{LoginOutcome, RegisterRequest};
use crate::ratelimit;

const DEFAULT_DEVICE: &str = "web";

fn device_label(requested: Option<String>) -> String {
    requested
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterBody,
    responses(
        (status = 201, description = "Account created", body = Envelope),
        (status = 400, description = "Validation failed", body = Envelope),
        (status = 409, description = "Email or username already taken", body = Envelope),
        (status = 429, description = "Registration budget exhausted for this address", body = Envelope)
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &REGISTER_THROTTLE, &ip).await?;
    let account = state
        .auth
        .register(RegisterRequest {
            name: body.name,
            username: body.username,
            email: body.email,
            password: body.password,
        })
        .await?;

    // Verification email delivery never blocks registration.
    if let Err(err) = state.verification.send(&account.email).await {
        warn!(error = %err, "failed to send verification email");
    }

    let mut response = created(
        "Registration successful",
        json!({ "user": AccountView::from(&account) }),
    );
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Authenticated, or two-factor verification required", body = Envelope),
        (status = 401, description = "Invalid credentials or account locked", body = Envelope),
        (status = 403, description = "Account deactivated", body = Envelope),
        (status = 429, description = "Throttled or address blocked", body = Envelope)
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let device = device_label(body.device_name);
    let outcome = state
        .auth
        .login(&body.identifier, &body.password, &device, &ip)
        .await?;

    let mut response = match outcome {
        LoginOutcome::Authenticated(session) => {
            ok("Login successful", LoginData::session(&session))
        }
        LoginOutcome::TwoFactorRequired { pending_token } => ok(
            "Two-factor authentication required",
            LoginData::pending(pending_token),
        ),
    };

    let max = u64::from(state.config.max_login_attempts);
    let key = ratelimit::login_key(&body.identifier, &ip);
    let remaining = state.limiter.remaining(&key, max).await?;
    RateLimitHeaders {
        limit: max,
        remaining,
    }
    .apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/2fa/verify",
    request_body = TwoFactorVerifyBody,
    responses(
        (status = 200, description = "Authenticated", body = Envelope),
        (status = 401, description = "Invalid code or expired pending token", body = Envelope),
        (status = 429, description = "Address blocked or verification budget exhausted", body = Envelope)
    ),
    tag = "auth"
)]
pub async fn verify_two_factor(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TwoFactorVerifyBody>,
) -> ApiResult {
    let ip = client_ip(&headers, peer);
    let budget = throttle_action(&state, &TWO_FACTOR_LOGIN_THROTTLE, &ip).await?;
    let device = device_label(body.device_name);
    let session = state
        .auth
        .verify_two_factor(&body.pending_token, &body.code, &device, &ip)
        .await?;
    let mut response = ok("Login successful", LoginData::session(&session));
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Session revoked", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let (record, _account) = require_session(&state, &headers).await?;
    state.auth.logout(record.id).await?;
    Ok(ok_empty("Logged out"))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 200, description = "All sessions revoked", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout_all(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let (record, _account) = require_session(&state, &headers).await?;
    let revoked = state.auth.logout_all(record.account_id).await?;
    Ok(ok("Logged out everywhere", json!({ "revoked": revoked })))
}

#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses(
        (status = 200, description = "Current account with roles and permissions", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    let roles: Vec<String> = state
        .rbac
        .roles_of(account.id)
        .await?
        .into_iter()
        .map(|role| role.slug)
        .collect();
    let permissions = state.rbac.effective_slugs(account.id).await?;
    Ok(ok(
        "OK",
        json!({
            "user": AccountView::from(&account),
            "roles": roles,
            "permissions": permissions,
        }),
    ))
}
