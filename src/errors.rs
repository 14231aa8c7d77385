use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for protocol errors that keeps the detail local.
/// Carries the session's current offset for `OffsetMismatch` so a client can
/// resynchronize from the error body alone.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub detail: String,
    pub offset: Option<i64>,
}

impl AppError {
    /// Create a new AppError with a specific status and detail message.
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            offset: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "detail": self.detail,
            "status": self.status.as_u16()
        });
        if let Some(offset) = self.offset {
            body["offset"] = json!(offset);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::MissingChunk
            | UploadError::MissingRangeHeader
            | UploadError::MissingParameters(_)
            | UploadError::OffsetMismatch { .. }
            | UploadError::SizeMismatch
            | UploadError::SizeLimitExceeded { .. }
            | UploadError::AlreadyComplete
            | UploadError::ChecksumMismatch => StatusCode::BAD_REQUEST,
            UploadError::Expired => StatusCode::GONE,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::Forbidden(_) => StatusCode::FORBIDDEN,
            UploadError::Sqlx(inner) => {
                tracing::error!("database error: {inner}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            UploadError::Io(inner) => {
                tracing::error!("storage error: {inner}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let offset = match &err {
            UploadError::OffsetMismatch { offset } => Some(*offset),
            _ => None,
        };

        Self {
            status,
            detail: err.to_string(),
            offset,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_mismatch_maps_to_bad_request_with_offset() {
        let app: AppError = UploadError::OffsetMismatch { offset: 50 }.into();
        assert_eq!(app.status, StatusCode::BAD_REQUEST);
        assert_eq!(app.offset, Some(50));
    }

    #[test]
    fn expired_maps_to_gone() {
        let app: AppError = UploadError::Expired.into();
        assert_eq!(app.status, StatusCode::GONE);
        assert_eq!(app.offset, None);
    }

    #[test]
    fn not_found_maps_to_404() {
        let app: AppError = UploadError::NotFound("abc".into()).into();
        assert_eq!(app.status, StatusCode::NOT_FOUND);
    }
}
