//! Unified error responses for the HTTP status surface, using the
//! problem+json format.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Unified API error response structure.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message.
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }
}

/// Standard error types with predefined status codes.
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Not Found")]
    NotFound,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            &error_type.to_string(),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<crate::repositories::RepositoryError> for ApiError {
    fn from(error: crate::repositories::RepositoryError) -> Self {
        match error {
            crate::repositories::RepositoryError::NotFound(what) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Not found: {}", what),
            ),
            crate::repositories::RepositoryError::Database(db) => db.into(),
        }
    }
}
