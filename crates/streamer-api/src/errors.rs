//! Error types for the streamer API.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Client-facing streamer errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No session / invalid credentials (401)
    #[error("{0}")]
    Unauthenticated(String),
    /// Device-code authorization still pending (428)
    #[error("Authorization pending: {0}")]
    AuthPending(String),
    /// Missing resource or no stream URL (404)
    #[error("{0}")]
    NotFound(String),
    /// Age-restricted media cannot be streamed (451)
    #[error("{0}")]
    AgeRestricted(String),
    /// Upstream rejected us and a refresh did not help (502)
    #[error("{0}")]
    BadGateway(String),
    /// Malformed client request (400)
    #[error("{0}")]
    BadRequest(String),
    /// Everything else (500)
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::AuthPending(_) => StatusCode::PRECONDITION_REQUIRED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AgeRestricted(_) => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = match self {
            ApiError::Unauthenticated(_) => "UNAUTHENTICATED",
            ApiError::AuthPending(_) => "AUTHORIZATION_PENDING",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::AgeRestricted(_) => "AGE_RESTRICTED",
            ApiError::BadGateway(_) => "BAD_GATEWAY",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Unauthenticated("no session".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::AgeRestricted("age gate".into()).status_code(),
            StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
        );
        assert_eq!(
            ApiError::BadGateway("cannot refresh".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::NotFound("no stream URL".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::AuthPending("authorization_pending".into()).status_code(),
            StatusCode::PRECONDITION_REQUIRED
        );
    }
}
