//! Uniform response envelope.
//!
//! Every response, success or failure, is `{success, message, data?,
//! errors?}`. Failures map the error taxonomy onto HTTP status codes and
//! never leak internal detail; throttled responses carry `Retry-After`.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;
use utoipa::ToSchema;

use crate::error::AuthError;

#[derive(Serialize, ToSchema)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,
}

/// 200 with a data payload.
pub fn ok<T: Serialize>(message: &str, data: T) -> Response {
    reply(StatusCode::OK, message, Some(json!(data)))
}

/// 200 with no payload.
pub fn ok_empty(message: &str) -> Response {
    reply(StatusCode::OK, message, None)
}

/// 201 with a data payload.
pub fn created<T: Serialize>(message: &str, data: T) -> Response {
    reply(StatusCode::CREATED, message, Some(json!(data)))
}

fn reply(status: StatusCode, message: &str, data: Option<Value>) -> Response {
    let body = Envelope {
        success: true,
        message: message.to_string(),
        data,
        errors: None,
    };
    (status, Json(body)).into_response()
}

/// Handler-level error: converts the taxonomy into the wire envelope.
pub struct ApiError(pub AuthError);

impl<E> From<E> for ApiError
where
    E: Into<AuthError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if let AuthError::Internal(inner) = &err {
            error!(error = %inner, "internal error");
        }

        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        let errors = err.retry_after().map(|seconds| {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
            json!({ "retry_after": seconds })
        });

        let body = Envelope {
            success: false,
            message: err.public_message(),
            data: None,
            errors,
        };
        (status, headers, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn success_envelope_shape() {
        let response = ok("Login successful", json!({ "token": "t" }));
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Login successful");
        assert_eq!(body["data"]["token"], "t");
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_after() {
        let response = ApiError(AuthError::RateLimited {
            retry_after_seconds: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).unwrap().to_str().unwrap(),
            "42"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["errors"]["retry_after"], 42);
    }

    #[tokio::test]
    async fn internal_errors_never_leak_detail() {
        let response =
            ApiError(AuthError::Internal(anyhow!("pool timeout at 10.1.2.3:5432"))).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(!body["message"].as_str().unwrap().contains("10.1.2.3"));
    }

    #[tokio::test]
    async fn taxonomy_status_mapping() {
        let cases = [
            (AuthError::Validation("x".into()), 400),
            (AuthError::Authentication("x".into()), 401),
            (AuthError::Forbidden("x".into()), 403),
            (AuthError::NotFound("x".into()), 404),
            (AuthError::Conflict("x".into()), 409),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}
