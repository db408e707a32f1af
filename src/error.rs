//! Error taxonomy for the access-control engine.
//!
//! Expected domain outcomes (bad credentials, lockouts, missing permissions)
//! are distinct variants so callers can pattern-match instead of catching a
//! broad error type. Anything unexpected (store or crypto failure) collapses
//! into `Internal` and is never surfaced verbatim to clients.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad input shape or a user-facing rejection of the request (400).
    #[error("{0}")]
    Validation(String),

    /// Bad credentials, invalid/expired token, or failed second factor (401).
    /// The message is intentionally generic to avoid account enumeration.
    #[error("{0}")]
    Authentication(String),

    /// The account is temporarily locked after repeated failures (423-style,
    /// reported as 401 with retry metadata).
    #[error("account is locked")]
    Locked { retry_after_seconds: i64 },

    /// Missing role or permission (403).
    #[error("{0}")]
    Forbidden(String),

    /// No such resource (404).
    #[error("{0}")]
    NotFound(String),

    /// Domain policy violation, e.g. deleting a protected system role or
    /// unlinking the sole login method (409).
    #[error("{0}")]
    Conflict(String),

    /// Too many attempts (429). Carries the seconds until the next attempt
    /// is allowed.
    #[error("too many attempts")]
    RateLimited { retry_after_seconds: i64 },

    /// Unexpected store/crypto failure (500). The source is logged but the
    /// client only ever sees a generic message.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// HTTP-style status class for the variant.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authentication(_) | Self::Locked { .. } => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Internal(_) => 500,
        }
    }

    /// Message safe to show to the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "An unexpected error occurred. Please try again.".to_string(),
            Self::Locked { retry_after_seconds } => {
                format!(
                    "Your account is locked. Please try again in {} minutes.",
                    (retry_after_seconds + 59) / 60
                )
            }
            Self::RateLimited {
                retry_after_seconds,
            } => {
                format!("Too many attempts. Please try again in {retry_after_seconds} seconds.")
            }
            other => other.to_string(),
        }
    }

    /// Seconds until retry, for `Locked` and `RateLimited`.
    #[must_use]
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            Self::Locked {
                retry_after_seconds,
            }
            | Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Generic credentials rejection. Never reveals whether the identifier exists.
#[must_use]
pub fn invalid_credentials() -> AuthError {
    AuthError::Authentication("The provided credentials are incorrect.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(AuthError::Validation("bad".into()).status_code(), 400);
        assert_eq!(invalid_credentials().status_code(), 401);
        assert_eq!(
            AuthError::Locked {
                retry_after_seconds: 60
            }
            .status_code(),
            401
        );
        assert_eq!(AuthError::Forbidden("no".into()).status_code(), 403);
        assert_eq!(AuthError::NotFound("missing".into()).status_code(), 404);
        assert_eq!(AuthError::Conflict("taken".into()).status_code(), 409);
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 30
            }
            .status_code(),
            429
        );
        assert_eq!(
            AuthError::Internal(anyhow::anyhow!("db down")).status_code(),
            500
        );
    }

    #[test]
    fn internal_message_never_leaks_source() {
        let err = AuthError::Internal(anyhow::anyhow!("connection refused to 10.0.0.5:5432"));
        assert!(!err.public_message().contains("10.0.0.5"));
    }

    #[test]
    fn locked_message_reports_minutes() {
        let err = AuthError::Locked {
            retry_after_seconds: 1800,
        };
        assert!(err.public_message().contains("30 minutes"));
        assert_eq!(err.retry_after(), Some(1800));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = AuthError::RateLimited {
            retry_after_seconds: 42,
        };
        assert_eq!(err.retry_after(), Some(42));
        assert!(err.public_message().contains("42 seconds"));
    }
}
