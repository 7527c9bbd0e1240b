//! HTTP error responses
//!
//! Every failure is returned as `{ "error": <message>, "code": <CODE> }` so
//! clients can tell an expired code from a used one.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use keylink_auth::DeviceAuthError;
use serde::Serialize;
use tracing::error;

/// Error codes for the device authorization API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    AlreadyApproved,
    Expired,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyApproved => StatusCode::CONFLICT,
            Self::Expired => StatusCode::GONE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyApproved => "ALREADY_APPROVED",
            Self::Expired => "EXPIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Error body with human-readable message and machine-readable code
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// An error ready to be sent to the client
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Seconds the client should wait, sent as `Retry-After`
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized, "Authentication required")
    }
}

impl From<DeviceAuthError> for ApiError {
    fn from(err: DeviceAuthError) -> Self {
        match err {
            DeviceAuthError::InvalidRequest(msg) => Self::bad_request(msg),
            DeviceAuthError::Unauthorized => Self::unauthorized(),
            DeviceAuthError::NotFound => Self::new(ErrorCode::NotFound, "Code not found"),
            DeviceAuthError::AlreadyApproved => {
                Self::new(ErrorCode::AlreadyApproved, "Code has already been used")
            }
            DeviceAuthError::Expired => {
                Self::new(ErrorCode::Expired, "Code expired, start pairing again")
            }
            DeviceAuthError::RateLimited { retry_after } => Self {
                retry_after: Some(retry_after),
                ..Self::new(ErrorCode::RateLimited, "Too many requests")
            },
            DeviceAuthError::Storage(e) => {
                error!("Storage failure: {}", e);
                Self::new(ErrorCode::Internal, "Internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.as_str(),
        };
        let mut response = (self.code.http_status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keylink_auth::StorageError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DeviceAuthError::InvalidRequest("x".into()), 400),
            (DeviceAuthError::Unauthorized, 401),
            (DeviceAuthError::NotFound, 404),
            (DeviceAuthError::AlreadyApproved, 409),
            (DeviceAuthError::Expired, 410),
            (DeviceAuthError::RateLimited { retry_after: 3 }, 429),
            (
                DeviceAuthError::Storage(StorageError::NotFound("x".into())),
                500,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).code.http_status().as_u16(), status);
        }
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = ApiError::from(DeviceAuthError::RateLimited { retry_after: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_storage_errors_are_opaque() {
        let err = ApiError::from(DeviceAuthError::Storage(StorageError::NotFound(
            "secret-path".into(),
        )));
        assert!(!err.message.contains("secret-path"));
    }
}
