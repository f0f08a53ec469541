use crate::services::error::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by HTTP handlers: a status code and a client-facing message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 401 Unauthorized (no usable caller identity)
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
            StorageError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            StorageError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StorageError::QuotaExpired(_) => StatusCode::PAYMENT_REQUIRED,
            StorageError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            StorageError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            StorageError::Backend { .. } => StatusCode::BAD_GATEWAY,
            StorageError::Configuration(_) | StorageError::Sqlx(_) | StorageError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
            // Database and policy-document details stay in the log.
            if matches!(err, StorageError::Sqlx(_) | StorageError::Json(_)) {
                return AppError::internal("internal storage error");
            }
        }
        AppError::new(status, err.to_string())
    }
}
