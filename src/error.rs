use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Security-Relevant Errors
///
/// `AuthenticationRequired`, `InvalidSignature`, and tenant-isolation
/// failures are never recovered locally: they always surface as a rejection
/// to the caller. `InvalidSignature` deliberately maps to a single generic
/// message regardless of which verification step failed, so the response
/// cannot be used as an oracle.
///
/// # Infrastructure Errors
///
/// `Store` covers shared key-value store failures. Whether a store failure
/// rejects or admits the request is decided by the per-limiter-class
/// failure policy, not here.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded {
        /// Seconds until the client may retry.
        retry_after: u64,
        /// Configured ceiling for the limiter class that rejected.
        limit: u32,
        /// Unix seconds at which the current window resets.
        reset_time: u64,
    },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),

    #[error("Tenant access denied")]
    TenantAccessDenied,

    #[error("Shared store operation failed: {0}")]
    Store(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal middleware error: {0}")]
    Internal(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for MiddlewareError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request rejected");

        let (status, error_type, message, retry_after) = match &self {
            MiddlewareError::AuthenticationRequired(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "Authentication required. Provide a valid tenant credential.".to_string(),
                None,
            ),

            MiddlewareError::RateLimitExceeded { retry_after, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                format!("Rate limit exceeded. Please retry after {retry_after} seconds."),
                Some(*retry_after),
            ),

            // Generic on purpose: the body must not reveal whether the header
            // was missing, the timestamp stale, or the digest wrong.
            MiddlewareError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                "Signature verification failed.".to_string(),
                None,
            ),

            MiddlewareError::DuplicateRequest(_) => (
                StatusCode::CONFLICT,
                "duplicate_request",
                "A request with this idempotency key is already in progress or completed."
                    .to_string(),
                None,
            ),

            MiddlewareError::FeatureNotAvailable(msg) => (
                StatusCode::FORBIDDEN,
                "feature_not_available",
                format!("Feature not available for this tenant: {msg}"),
                None,
            ),

            // Deliberately sparse: the body confirms the denial and nothing
            // about which tenant's data was targeted.
            MiddlewareError::TenantAccessDenied => (
                StatusCode::FORBIDDEN,
                "tenant_access_denied",
                "Access to the requested resource is denied.".to_string(),
                None,
            ),

            MiddlewareError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                "A backing store operation failed. Please try again.".to_string(),
                None,
            ),

            MiddlewareError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None)
            }

            MiddlewareError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.".to_string(),
                None,
            ),

            MiddlewareError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            retry_after,
        };

        let mut response = (status, axum::Json(body)).into_response();

        // 429 responses carry Retry-After so well-behaved clients back off.
        if let MiddlewareError::RateLimitExceeded { retry_after, .. } = &self
            && let Ok(value) = retry_after.to_string().parse()
        {
            response.headers_mut().insert("Retry-After", value);
        }

        response
    }
}

/// Convenience type alias for Results with MiddlewareError.
pub type MiddlewareResult<T> = Result<T, MiddlewareError>;
