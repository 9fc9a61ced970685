//! Error Handling
//!
//! Unified error types for the service. `AppError` covers infrastructure and
//! request-level failures; `FailureKind` is the operator-facing taxonomy a
//! failed analysis task is labeled with.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rule file / frontmatter parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Agent command execution errors
    #[error("Command error: {0}")]
    Command(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict with existing state (duplicate ids, etc.)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body returned to API clients. Internal detail stays in logs.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Task failure taxonomy
// ============================================================================

/// Operator-visible category attached to a failed task.
///
/// Each kind maps to a stable label and a retry hint surfaced in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BadRequest,
    ArtifactFetch,
    DecryptFailure,
    ExtractFailure,
    RuleSelectFailure,
    AgentUnavailable,
    AgentTimeout,
    AgentCrash,
    ParseFailure,
    Cancelled,
    ServerRestart,
}

impl FailureKind {
    /// Stable label persisted in the task record's `error` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::ArtifactFetch => "ArtifactFetch",
            Self::DecryptFailure => "DecryptFailure",
            Self::ExtractFailure => "ExtractFailure",
            Self::RuleSelectFailure => "RuleSelectFailure",
            Self::AgentUnavailable => "AgentUnavailable",
            Self::AgentTimeout => "AgentTimeout",
            Self::AgentCrash => "AgentCrash",
            Self::ParseFailure => "ParseFailure",
            Self::Cancelled => "Cancelled",
            Self::ServerRestart => "ServerRestart",
        }
    }

    /// Whether a human may reasonably re-run the task after fixing the cause.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            Self::BadRequest | Self::RuleSelectFailure | Self::Cancelled
        )
    }

    /// Parse a label back from the database.
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "BadRequest" => Some(Self::BadRequest),
            "ArtifactFetch" => Some(Self::ArtifactFetch),
            "DecryptFailure" => Some(Self::DecryptFailure),
            "ExtractFailure" => Some(Self::ExtractFailure),
            "RuleSelectFailure" => Some(Self::RuleSelectFailure),
            "AgentUnavailable" => Some(Self::AgentUnavailable),
            "AgentTimeout" => Some(Self::AgentTimeout),
            "AgentCrash" => Some(Self::AgentCrash),
            "ParseFailure" => Some(Self::ParseFailure),
            "Cancelled" => Some(Self::Cancelled),
            "ServerRestart" => Some(Self::ServerRestart),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A pipeline stage failure: a category plus a sanitized human message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::database("connection failed");
        assert_eq!(err.to_string(), "Database error: connection failed");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::not_found("missing").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::conflict("dup").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));
    }

    #[test]
    fn test_failure_kind_label_roundtrip() {
        for kind in [
            FailureKind::BadRequest,
            FailureKind::ArtifactFetch,
            FailureKind::DecryptFailure,
            FailureKind::ExtractFailure,
            FailureKind::RuleSelectFailure,
            FailureKind::AgentUnavailable,
            FailureKind::AgentTimeout,
            FailureKind::AgentCrash,
            FailureKind::ParseFailure,
            FailureKind::Cancelled,
            FailureKind::ServerRestart,
        ] {
            assert_eq!(FailureKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(FailureKind::from_label("NotAKind"), None);
    }

    #[test]
    fn test_failure_kind_retry_hints() {
        assert!(!FailureKind::BadRequest.retryable());
        assert!(!FailureKind::RuleSelectFailure.retryable());
        assert!(FailureKind::AgentTimeout.retryable());
        assert!(FailureKind::ServerRestart.retryable());
    }

    #[test]
    fn test_stage_error_format() {
        let err = StageError::new(FailureKind::AgentTimeout, "provider exceeded 300s");
        assert_eq!(err.to_string(), "AgentTimeout: provider exceeded 300s");
    }
}
