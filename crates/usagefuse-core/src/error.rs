//! Unified error handling for usagefuse-core
//!
//! These are *hard* failures: no snapshot could be produced at all. A source
//! that fails while others keep working is not an `Error`; it ends up as a
//! diagnostic on the snapshot (see [`crate::services::fusion::SourceError`]).

use thiserror::Error;

/// Core error type for usagefuse-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Required source '{source_name}' unavailable: {reason}")]
    RequiredSource { source_name: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for usagefuse-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a required-source error
    pub fn required_source(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::RequiredSource {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the caller must change configuration before retrying
    pub fn is_config_problem(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Validation(_))
    }
}

impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("account id is empty");
        assert_eq!(err.to_string(), "Configuration error: account id is empty");
    }

    #[test]
    fn test_required_source_display() {
        let err = Error::required_source("billing", "connection refused");
        assert_eq!(
            err.to_string(),
            "Required source 'billing' unavailable: connection refused"
        );
        assert!(!err.is_config_problem());
    }

    #[test]
    fn test_error_conversion_to_string() {
        let err = Error::validation("Invalid input");
        assert!(err.is_config_problem());
        let s: String = err.into();
        assert!(s.contains("Validation error"));
    }
}
