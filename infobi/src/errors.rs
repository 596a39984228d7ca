use crate::execution::ExecutionError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

/// Request or configuration problems detected before anything reaches a backend.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The connection names a database type we cannot talk to
    #[error("Unsupported database type: {dialect}")]
    UnsupportedDialect { dialect: String },

    /// Malformed request shape (bad row range, null filter value, unknown aggregate...)
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Two metrics in one request share an output name
    #[error("Duplicate metric name '{name}'")]
    DuplicateMetric { name: String },

    /// More group keys than grouping columns in a drill request
    #[error("Drill depth {depth} exceeds the {levels} configured grouping levels")]
    DrillDepthExceeded { depth: usize, levels: usize },

    /// Column not present in the report schema (only raised when identifier validation is enabled)
    #[error("Unknown column '{column}'")]
    UnknownColumn { column: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::InvalidRequest { message: message.into() }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request or configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The backend rejected or failed to run a statement
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn report_not_found(id: i64) -> Self {
        Error::NotFound {
            resource: "Report".to_string(),
            id: id.to_string(),
        }
    }

    pub fn connection_not_found(id: i64) -> Self {
        Error::NotFound {
            resource: "Connection".to_string(),
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::BAD_REQUEST,
            // Backend text is surfaced to the caller on purpose: report authors debug their SQL with it
            Error::Execution(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(e) => e.to_string(),
            Error::Execution(e) => format!("Query execution failed: {e}"),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Execution(_) => {
                tracing::warn!("Query execution error: {}", self);
            }
            Error::Config(_) | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        (status, Json(json!({ "detail": self.user_message() }))).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::from(ConfigError::UnsupportedDialect {
                dialect: "oracle".to_string()
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::from(ExecutionError::Backend("Invalid column name 'Foo'".to_string())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::report_not_found(7).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Other(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_execution_message_carries_backend_text() {
        let err = Error::from(ExecutionError::Backend("Invalid column name 'Foo'".to_string()));
        assert!(err.user_message().contains("Invalid column name 'Foo'"));
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = Error::Other(anyhow::anyhow!("password=hunter2 leaked"));
        assert_eq!(err.user_message(), "Internal server error");
    }
}
