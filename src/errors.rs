use crate::{services::chunk_service::UploadError, storage::StorageError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
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

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidPath(_) | StorageError::UnsupportedType(_) => {
                StatusCode::BAD_REQUEST
            }
            StorageError::NotConfigured(_) => StatusCode::CONFLICT,
            StorageError::Backend { .. } | StorageError::Mount(_) | StorageError::Io(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        if status == StatusCode::BAD_GATEWAY {
            error!(error = %err, "storage backend failure");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match err {
            UploadError::Storage(inner) => return inner.into(),
            UploadError::Sqlx(db_err) => {
                error!(error = %db_err, "database failure");
                return AppError::internal("database error");
            }
            UploadError::InvalidChunkIndex { .. }
            | UploadError::InvalidChunkSize { .. }
            | UploadError::InvalidHash(_)
            | UploadError::ContentMismatch { .. }
            | UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::SessionNotFound(_) | UploadError::FileNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::UploadIncomplete { .. } | UploadError::AlreadyCompleted(_) => {
                StatusCode::CONFLICT
            }
            UploadError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };
        AppError::new(status, err.to_string())
    }
}
