/// Unified error types for FillTheHole
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum HoleError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Authentication errors
    ///
    /// Login failures carry one fixed message regardless of the underlying
    /// cause; the cause is recorded in the attempt log instead.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Report location falls outside the service region
    #[error("Location is outside the service area")]
    OutOfRegion,

    /// Upload exceeds the configured size cap
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Content rejected by automated moderation
    #[error("Content rejected: {0}")]
    Rejected(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: std::time::Duration },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., duplicate account, challenge already used)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream collaborator unavailable
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert HoleError to HTTP response
impl IntoResponse for HoleError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            HoleError::RateLimitExceeded { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };

        let (status, error_code, message) = match self {
            HoleError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            HoleError::Authorization(_) => (StatusCode::FORBIDDEN, "Forbidden", self.to_string()),
            HoleError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            HoleError::OutOfRegion => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "OutOfRegion",
                self.to_string(),
            ),
            HoleError::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PayloadTooLarge",
                self.to_string(),
            ),
            HoleError::Rejected(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "ContentRejected",
                self.to_string(),
            ),
            HoleError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            HoleError::Conflict(_) => (StatusCode::CONFLICT, "Conflict", self.to_string()),
            HoleError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                "Too many requests. Please try again later.".to_string(),
            ),
            HoleError::UpstreamUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UpstreamUnavailable",
                "A dependent service is unavailable".to_string(),
            ),
            HoleError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "Internal server error".to_string(), // Don't leak details
                )
            }
            HoleError::Internal(ref e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "Internal server error".to_string(),
                )
            }
            HoleError::Io(ref e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for service operations
pub type HoleResult<T> = Result<T, HoleError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = HoleError::RateLimitExceeded {
            retry_after: Duration::from_secs(42),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            HoleError::OutOfRegion.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            HoleError::Conflict("x".into()).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HoleError::Internal("secret detail".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
