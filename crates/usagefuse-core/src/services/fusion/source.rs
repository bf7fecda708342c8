//! Source trait and error types
//!
//! A source is one independent, optional collaborator that contributes data
//! to a snapshot: a local service, an on-disk database, a log directory, a
//! remote API.

use async_trait::async_trait;
use thiserror::Error;

use super::config::{AccountConfig, FetchContext};
use crate::models::{Contribution, Snapshot};

// ============================================================================
// Error Types
// ============================================================================

/// Why a source could not contribute
///
/// `Unauthorized`/`TokenExpired` and `RateLimited` are structured signals the
/// classifier acts on; every other variant ends up as a plain diagnostic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Tool, binary, directory or endpoint is not installed/configured
    #[error("Not installed: {0}")]
    NotInstalled(String),

    /// Authentication failed or credential is invalid
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token expired")]
    TokenExpired,

    /// Upstream rejected the call for rate reasons (429-equivalent)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Credential/authorization failure signal
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SourceError::Unauthorized(_) | SourceError::TokenExpired)
    }

    /// Rate-limit signal
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SourceError::RateLimited(_))
    }

    /// Required tooling is entirely unavailable
    pub fn is_missing_tooling(&self) -> bool {
        matches!(self, SourceError::NotInstalled(_))
    }

    /// Whether the error carries a structured status signal
    pub fn is_signal(&self) -> bool {
        self.is_auth_failure() || self.is_rate_limited()
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout("request timed out".to_string())
        } else if err.is_connect() {
            SourceError::NetworkError("Connection failed".to_string())
        } else if err.is_status() {
            match err.status() {
                Some(status) => SourceError::from_status(status.as_u16(), ""),
                None => SourceError::NetworkError(err.to_string()),
            }
        } else if err.is_decode() {
            SourceError::ParseError(err.to_string())
        } else {
            SourceError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::ParseError(err.to_string())
    }
}

impl SourceError {
    /// Map a non-success HTTP status to its structured error
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };
        match status {
            401 | 403 => SourceError::Unauthorized(detail),
            429 => SourceError::RateLimited(detail),
            _ => SourceError::ApiError(detail),
        }
    }
}

// ============================================================================
// Source Trait
// ============================================================================

/// A data source the fusion engine calls once per fetch cycle
///
/// Sources write only into the [`Contribution`] they are handed; the engine
/// merges it into the snapshot after `fetch` returns `Ok`. A source never
/// sets status or message.
///
/// # Example Implementation
///
/// ```ignore
/// use async_trait::async_trait;
/// use usagefuse_core::models::{Contribution, Metric, Snapshot};
/// use usagefuse_core::services::fusion::{AccountConfig, FetchContext, Source, SourceError};
///
/// struct LocalCounter;
///
/// #[async_trait]
/// impl Source for LocalCounter {
///     fn name(&self) -> &str {
///         "local"
///     }
///
///     async fn fetch(
///         &self,
///         _ctx: &FetchContext,
///         _account: &AccountConfig,
///         _current: &Snapshot,
///         out: &mut Contribution,
///     ) -> Result<bool, SourceError> {
///         out.set_metric("messages_today", Metric::count(12.0, "messages", "today"));
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable name, used as the diagnostics key
    fn name(&self) -> &str;

    /// Cache groups this source owns
    ///
    /// Declared groups that the source does not populate in a cycle are
    /// restored from the resilience cache.
    fn cache_groups(&self) -> Vec<String> {
        Vec::new()
    }

    /// Contribute to the snapshot under construction
    ///
    /// `current` is a read-only view of what earlier sources produced.
    /// Returns whether usable data was contributed.
    ///
    /// # Errors
    ///
    /// Returns `SourceError` if:
    /// - The tool or endpoint is not available (`NotInstalled`)
    /// - Credentials are rejected (`Unauthorized`, `TokenExpired`)
    /// - Upstream throttles the call (`RateLimited`)
    /// - Anything else goes wrong (`NetworkError`, `ParseError`, ...)
    async fn fetch(
        &self,
        ctx: &FetchContext,
        account: &AccountConfig,
        current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError>;
}

// ============================================================================
// Tests
// ============================================================================
