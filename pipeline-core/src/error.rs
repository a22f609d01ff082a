use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the pipeline.
///
/// Retryability is a property of the variant, not of the call site:
/// queue handlers and the delivery engine consult `is_retryable` to
/// decide between backoff-requeue and dead-letter.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Rate limited: retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Transient failure: {0}")]
    Transient(anyhow::Error),

    #[error("Credentials expired for destination {0}")]
    CredentialsExpired(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(anyhow::Error),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Stale timestamp: {0}")]
    StaleTimestamp(String),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a queue item failing with this error should be requeued
    /// with backoff. Credential and signature failures are permanent;
    /// everything transport-shaped is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_)
                | AppError::RateLimited { .. }
                | AppError::DatabaseError(_)
                | AppError::DeliveryFailed(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Transient(anyhow::Error::new(err))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details, retry_after) = match self {
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None, None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, None),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string(), None, None),
            AppError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests".to_string(),
                None,
                Some(retry_after),
            ),
            AppError::Transient(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Temporarily unavailable".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::CredentialsExpired(dest) => (
                StatusCode::UNAUTHORIZED,
                format!("Destination {} requires re-authorization", dest),
                None,
                None,
            ),
            AppError::DeliveryFailed(err) => (
                StatusCode::BAD_GATEWAY,
                "Delivery failed".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "Invalid signature".to_string(),
                None,
                None,
            ),
            AppError::StaleTimestamp(msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::ConfigError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(format!("{:#}", err)),
                None,
            ),
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
