//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use crate::db::StoreError;
use crate::session::SessionError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ambiguous node: {0}")]
    AmbiguousNode(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Authorization check failed: {0}")]
    AuthorizationCheckFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Closed => AppError::SessionClosed,
            SessionError::DeadlineExceeded => AppError::DeadlineExceeded,
            SessionError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AppError {
    /// HTTP status and stable error code
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::AmbiguousNode(_) => (StatusCode::CONFLICT, "AMBIGUOUS_NODE"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::AuthorizationCheckFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "AUTHORIZATION_CHECK_FAILED")
            }
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::SessionClosed => (StatusCode::INTERNAL_SERVER_ERROR, "SESSION_CLOSED"),
            AppError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "DEADLINE_EXCEEDED"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status();
        let (message, details) = match &self {
            AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::AmbiguousNode(msg)
            | AppError::Forbidden(msg)
            | AppError::Validation(msg) => (msg.clone(), None),
            AppError::AuthorizationCheckFailed(msg) => {
                error!("Authorization check failed: {}", msg);
                (
                    "Unable to verify the attachment is permitted".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Store(e) => {
                error!("Store error: {:?}", e);
                ("A database error occurred".to_string(), Some(e.to_string()))
            }
            AppError::SessionClosed => {
                error!("Operation on a closed session");
                ("An internal error occurred".to_string(), None)
            }
            AppError::DeadlineExceeded => (
                "The operation did not complete in time and was rolled back".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::NotFound("x".into()).status().0, StatusCode::NOT_FOUND);
        assert_eq!(AppError::Conflict("x".into()).status().0, StatusCode::CONFLICT);
        assert_eq!(AppError::AmbiguousNode("n".into()).status().0, StatusCode::CONFLICT);
        assert_eq!(AppError::Forbidden("x".into()).status().0, StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::AuthorizationCheckFailed("x".into()).status().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Store(StoreError::Backend("down".into())).status().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Store(StoreError::Pool(deadpool_postgres::PoolError::Closed)).status(),
            (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
        );
        assert_eq!(AppError::DeadlineExceeded.status().0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(AppError::Validation("x".into()).status().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_session_errors_convert() {
        assert!(matches!(AppError::from(SessionError::Closed), AppError::SessionClosed));
        assert!(matches!(
            AppError::from(SessionError::DeadlineExceeded),
            AppError::DeadlineExceeded
        ));
        assert!(matches!(
            AppError::from(SessionError::Store(StoreError::Decode("x".into()))),
            AppError::Store(StoreError::Decode(_))
        ));
    }

    #[test]
    fn test_error_response_status() {
        let response = AppError::Forbidden("not published".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
