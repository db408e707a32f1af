//! Two-factor enrollment management. Login-time verification lives in
//! `handlers::auth`.

use axum::{Extension, Json, http::HeaderMap};
use serde_json::json;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::envelope::{ApiResult, Envelope, ok, ok_empty};
use crate::api::handlers::{
    RECOVERY_CODES_THROTTLE, TWO_FACTOR_SETUP_THROTTLE, require_session, throttle_action,
};
use crate::api::types::{CodeBody, PasswordBody, TwoFactorSetupView};

#[utoipa::path(
    post,
    path = "/v1/auth/2fa/enable",
    responses(
        (status = 200, description = "Pending enrollment created; secret and recovery codes returned once", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope),
        (status = 409, description = "Already enabled", body = Envelope),
        (status = 429, description = "Setup budget exhausted for this account", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "two-factor"
)]
pub async fn enable(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    let budget =
        throttle_action(&state, &TWO_FACTOR_SETUP_THROTTLE, &account.id.to_string()).await?;
    let setup = state.two_factor.enable(account.id).await?;
    let mut response = ok(
        "Scan the QR code and confirm with a code to finish enrollment",
        TwoFactorSetupView::from(setup),
    );
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/2fa/confirm",
    request_body = CodeBody,
    responses(
        (status = 200, description = "Two-factor authentication enabled", body = Envelope),
        (status = 400, description = "Invalid verification code", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope),
        (status = 429, description = "Setup budget exhausted for this account", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "two-factor"
)]
pub async fn confirm(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CodeBody>,
) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    let budget =
        throttle_action(&state, &TWO_FACTOR_SETUP_THROTTLE, &account.id.to_string()).await?;
    state.two_factor.confirm_enable(account.id, &body.code).await?;
    let mut response = ok_empty("Two-factor authentication enabled");
    budget.apply(&mut response);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/2fa/disable",
    request_body = PasswordBody,
    responses(
        (status = 200, description = "Two-factor authentication disabled", body = Envelope),
        (status = 401, description = "Current password incorrect", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "two-factor"
)]
pub async fn disable(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PasswordBody>,
) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    state.auth.disable_two_factor(account.id, &body.password).await?;
    Ok(ok_empty("Two-factor authentication disabled"))
}

#[utoipa::path(
    post,
    path = "/v1/auth/2fa/recovery-codes",
    responses(
        (status = 200, description = "Fresh recovery codes; previous codes are void", body = Envelope),
        (status = 400, description = "Two-factor authentication is not enabled", body = Envelope),
        (status = 401, description = "Not authenticated", body = Envelope),
        (status = 429, description = "Regeneration budget exhausted for this account", body = Envelope)
    ),
    security(("bearer" = [])),
    tag = "two-factor"
)]
pub async fn regenerate_recovery_codes(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let (_record, account) = require_session(&state, &headers).await?;
    let budget =
        throttle_action(&state, &RECOVERY_CODES_THROTTLE, &account.id.to_string()).await?;
    let codes = state.two_factor.regenerate_recovery_codes(account.id).await?;
    let mut response = ok(
        "New recovery codes generated",
        json!({ "recovery_codes": codes }),
    );
    budget.apply(&mut response);
    Ok(response)
}
