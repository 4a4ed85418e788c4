//! Error types for HAT Core.
//!
//! This module defines the error taxonomy shared by every component of the
//! synchronization core.

use thiserror::Error;

/// Result type alias for HAT Core operations
pub type HatResult<T> = Result<T, HatError>;

/// Main error type for HAT Core operations
#[derive(Error, Debug)]
pub enum HatError {
    /// A location fix reported a negative horizontal accuracy.
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// Local storage could not be opened or written.
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    /// The remote table does not exist yet.
    #[error("Table not found: {table} ({source_name})")]
    TableNotFound { table: String, source_name: String },

    /// The HAT rejected the access token, or no valid token is held.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Any status the caller has no recovery for.
    #[error("Unexpected response: HTTP {status}: {message}")]
    UnexpectedResponse { status: u16, message: String },

    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl HatError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        HatError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new unexpected response error
    pub fn unexpected(status: u16, message: impl Into<String>) -> Self {
        HatError::UnexpectedResponse {
            status,
            message: message.into(),
        }
    }

    /// Create a new store error
    pub fn store(message: impl Into<String>) -> Self {
        HatError::StoreUnavailable(message.into())
    }

    /// Transient failures are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, HatError::Network(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HatError::Unauthorized(_))
    }
}

impl From<rusqlite::Error> for HatError {
    fn from(err: rusqlite::Error) -> Self {
        HatError::StoreUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for HatError {
    fn from(err: reqwest::Error) -> Self {
        HatError::Network(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for HatError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        HatError::StoreUnavailable("lock poisoned".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = HatError::validation("kind", "unknown note kind");
        assert_eq!(err.to_string(), "Validation error in kind: unknown note kind");
    }

    #[test]
    fn test_rusqlite_maps_to_store_unavailable() {
        let err: HatError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, HatError::StoreUnavailable(_)));
    }

    #[test]
    fn test_unexpected_response_display() {
        let err = HatError::unexpected(500, "server error");
        assert_eq!(err.to_string(), "Unexpected response: HTTP 500: server error");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_network_is_transient() {
        assert!(HatError::Network("timeout".to_string()).is_transient());
        assert!(HatError::Unauthorized("expired".to_string()).is_unauthorized());
    }
}
