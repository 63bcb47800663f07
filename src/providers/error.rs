//! Structured sync error taxonomy shared by all provider clients.
//!
//! The kind decides retry behavior: Transient and RateLimited are retried
//! with backoff, Unauthorized and Permanent fail the run immediately. Errors
//! serialize to JSON so a failed run's cause survives in the database.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Authentication/authorization failure
    Unauthorized,
    /// Rate limited with optional retry after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient/retryable error
    Transient,
    /// Permanent/non-retryable error
    Permanent,
}

impl SyncError {
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Unauthorized,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: SyncErrorKind::RateLimited { retry_after_secs },
            message: None,
            details: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Transient,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Permanent,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the orchestrator may retry the failed step.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. }
        )
    }

    /// Map an upstream HTTP status to the error taxonomy.
    pub fn from_status(status: u16, retry_after_secs: Option<u64>, body: Option<String>) -> Self {
        match status {
            401 | 403 => Self::unauthorized(format!(
                "HTTP {}: {}",
                status,
                body.unwrap_or_default()
            )),
            429 => Self::rate_limited(retry_after_secs),
            400..=499 => Self::permanent(format!(
                "HTTP {}: {}",
                status,
                body.unwrap_or_default()
            )),
            _ => Self::transient(format!("HTTP {}: {}", status, body.unwrap_or_default())),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyncErrorKind::Unauthorized => {
                write!(f, "Unauthorized")?;
                if let Some(msg) = &self.message {
                    write!(f, ": {}", msg)?;
                }
            }
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
                if let Some(msg) = &self.message {
                    write!(f, ": {}", msg)?;
                }
            }
            SyncErrorKind::Transient => {
                write!(f, "Transient error")?;
                if let Some(msg) = &self.message {
                    write!(f, ": {}", msg)?;
                }
            }
            SyncErrorKind::Permanent => {
                write!(f, "Permanent error")?;
                if let Some(msg) = &self.message {
                    write!(f, ": {}", msg)?;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SyncError::transient(format!("network error: {}", err))
        } else if err.is_decode() {
            SyncError::transient(format!("malformed response: {}", err))
        } else {
            SyncError::permanent(format!("request error: {}", err))
        }
    }
}

impl From<sea_orm::DbErr> for SyncError {
    fn from(err: sea_orm::DbErr) -> Self {
        SyncError::transient(format!("database error: {}", err))
    }
}

impl From<crate::repositories::RepositoryError> for SyncError {
    fn from(err: crate::repositories::RepositoryError) -> Self {
        SyncError::transient(err.to_string())
    }
}
