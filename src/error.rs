// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Invalid model name
    #[error("Invalid model: {0}")]
    #[allow(dead_code)]
    InvalidModel(String),

    /// Error from Kiro API
    #[error("Kiro API error: {status} - {message}")]
    KiroApiError { status: u16, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[allow(dead_code)]
    ConfigError(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No account in the pool is currently eligible to serve a request
    /// (all disabled, cooling down, or quota-exhausted).
    #[error("No healthy accounts available: {0}")]
    NoHealthyAccounts(String),

    /// Every eligible account failed the request (local/network failure, or
    /// the retry budget across the whole pool was exhausted).
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Maps a dispatcher-boundary failure onto the HTTP-facing error taxonomy.
pub fn dispatch_error_to_api(err: crate::dispatcher::DispatchError) -> ApiError {
    use crate::dispatcher::DispatchError;

    match err {
        DispatchError::NoHealthyAccounts => {
            ApiError::NoHealthyAccounts("no eligible Kiro accounts in the pool".to_string())
        }
        DispatchError::Local(message) => ApiError::UpstreamUnavailable(message),
        DispatchError::BadRequest(message) => ApiError::ValidationError(message),
        DispatchError::Exhausted { message, .. } => ApiError::UpstreamUnavailable(message),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            ApiError::InvalidModel(msg) => (StatusCode::BAD_REQUEST, "invalid_model", msg),
            ApiError::KiroApiError { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status_code, "kiro_api_error", message)
            }
            ApiError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::NoHealthyAccounts(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_healthy_accounts", msg)
            }
            ApiError::UpstreamUnavailable(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable", msg)
            }
            ApiError::Internal(err) => {
                // Log internal errors
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
#[allow(dead_code)]
pub type Result<T> = std::result::Result<T, ApiError>;
