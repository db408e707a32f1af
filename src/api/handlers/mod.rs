//! Request handlers.
//!
//! Shared here: bearer-token extraction, session lookup, permission gates,
//! client address resolution, and the per-action throttle budgets. Handlers
//! return the uniform envelope via `ApiResult`.

use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::AppState;
use crate::error::{AuthError, AuthResult};
use crate::ratelimit;
use crate::store::{AccountRecord, TokenKind, TokenRecord};

pub mod admin;
pub mod auth;
pub mod health;
pub mod password;
pub mod permissions;
pub mod social;
pub mod two_factor;
pub mod verification;

/// Attempt budget for one endpoint, keyed per caller: the address for
/// anonymous requests, the account id once authenticated.
pub(crate) struct ActionThrottle {
    action: &'static str,
    max: u64,
    decay_seconds: i64,
}

impl ActionThrottle {
    const fn new(action: &'static str, max: u64, decay_seconds: i64) -> Self {
        Self {
            action,
            max,
            decay_seconds,
        }
    }
}

pub(crate) const REGISTER_THROTTLE: ActionThrottle = ActionThrottle::new("register", 3, 3600);
pub(crate) const TWO_FACTOR_LOGIN_THROTTLE: ActionThrottle = ActionThrottle::new("2fa", 10, 900);
pub(crate) const TWO_FACTOR_SETUP_THROTTLE: ActionThrottle =
    ActionThrottle::new("2fa_setup", 3, 3600);
pub(crate) const RECOVERY_CODES_THROTTLE: ActionThrottle =
    ActionThrottle::new("recovery_codes", 1, 3600);
pub(crate) const PASSWORD_RESET_THROTTLE: ActionThrottle =
    ActionThrottle::new("password_reset", 3, 3600);
pub(crate) const PASSWORD_UPDATE_THROTTLE: ActionThrottle =
    ActionThrottle::new("password_update", 3, 3600);
pub(crate) const EMAIL_VERIFY_THROTTLE: ActionThrottle =
    ActionThrottle::new("email_verification", 5, 3600);
pub(crate) const EMAIL_RESEND_THROTTLE: ActionThrottle =
    ActionThrottle::new("email_resend", 2, 3600);
pub(crate) const SOCIAL_LOGIN_THROTTLE: ActionThrottle = ActionThrottle::new("social", 10, 60);

/// `X-RateLimit-*` values advertising what is left of an attempt budget.
pub(crate) struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
}

impl RateLimitHeaders {
    pub(crate) fn apply(&self, response: &mut Response) {
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
    }
}

/// Charge one attempt against the action's budget. Rejects with 429 once the
/// budget is spent; failed attempts consume it like successful ones.
pub(crate) async fn throttle_action(
    state: &Arc<AppState>,
    throttle: &ActionThrottle,
    subject: &str,
) -> AuthResult<RateLimitHeaders> {
    let key = ratelimit::action_key("rate_limit", throttle.action, subject);
    if state.limiter.too_many_attempts(&key, throttle.max).await? {
        let retry = state
            .limiter
            .available_in(&key)
            .await?
            .unwrap_or(throttle.decay_seconds);
        return Err(AuthError::RateLimited {
            retry_after_seconds: retry,
        });
    }
    state.limiter.hit(&key, throttle.decay_seconds).await?;
    let remaining = state.limiter.remaining(&key, throttle.max).await?;
    Ok(RateLimitHeaders {
        limit: throttle.max,
        remaining,
    })
}

/// Pull the bearer secret out of the `Authorization` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> AuthResult<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::Authentication("Invalid or expired token".to_string()))
}

/// Authenticate the request with a session token and load its account.
/// Pending two-factor tokens are not sessions and are rejected here.
pub(crate) async fn require_session(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> AuthResult<(TokenRecord, AccountRecord)> {
    let secret = bearer_token(headers)?;
    let record = state.tokens.authenticate(secret).await?;
    if record.kind != TokenKind::Session {
        return Err(AuthError::Authentication(
            "Invalid or expired token".to_string(),
        ));
    }
    let account = state
        .accounts
        .find_by_id(record.account_id)
        .await?
        .ok_or_else(|| AuthError::Authentication("Invalid or expired token".to_string()))?;
    if !account.is_active {
        return Err(AuthError::Forbidden(
            "Your account has been deactivated".to_string(),
        ));
    }
    Ok((record, account))
}

/// Session plus a live permission check against current role assignments.
pub(crate) async fn require_permission(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    permission: &str,
) -> AuthResult<(TokenRecord, AccountRecord)> {
    let (record, account) = require_session(state, headers).await?;
    if !state.rbac.has_permission(account.id, permission).await? {
        return Err(AuthError::Forbidden(
            "You do not have permission to perform this action".to_string(),
        ));
    }
    Ok((record, account))
}

/// Client address: first `X-Forwarded-For` hop when present, else the socket
/// peer.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(bearer_token(&headers).is_err());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let peer: SocketAddr = "203.0.113.9:443".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "198.51.100.7");
    }
}
