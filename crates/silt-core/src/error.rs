//! Error taxonomy for the sink.
//!
//! Errors carry a retry classification: transient target-database failures
//! (serialization, timeouts, lost connections) are retried with backoff,
//! while malformed input and invariant violations surface immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed ingress payloads
    Request,
    /// Target schema disagreements
    Schema,
    /// Configuration errors
    Configuration,
    /// User-script callback failures
    Script,
    /// Network and database transients
    Transient,
    /// Serialization errors
    Serialization,
    /// Invariant violations requiring operator intervention
    Fatal,
    /// Other/unknown errors
    Other,
}

/// Sink-specific errors.
#[derive(Error, Debug)]
pub enum SiltError {
    /// Malformed input from the ingress surface; not retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A target column is missing and no extras column is configured.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A compare-and-set predicate failed and no resolution was possible.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A delete arrived with no table configured to receive it.
    #[error("no delete target for source {0}")]
    NoDeleteTarget(String),

    /// A user-script callback raised.
    #[error("script error: {0}")]
    Script(String),

    /// Transient database or network failure; retriable.
    #[error("transient: {0}")]
    Transient(String),

    /// A per-call deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation; shuts the owning loop down.
    #[error("fatal: {0}")]
    Fatal(String),

    /// JSON encode/decode error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Target database error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl SiltError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// True for errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            Self::BadRequest(_)
            | Self::SchemaMismatch(_)
            | Self::Conflict(_)
            | Self::NoDeleteTarget(_)
            | Self::Script(_)
            | Self::Config(_)
            | Self::Fatal(_)
            | Self::Json(_) => false,
        }
    }

    /// Category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadRequest(_) => ErrorCategory::Request,
            Self::SchemaMismatch(_) => ErrorCategory::Schema,
            Self::Conflict(_) => ErrorCategory::Other,
            Self::NoDeleteTarget(_) => ErrorCategory::Configuration,
            Self::Script(_) => ErrorCategory::Script,
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) => ErrorCategory::Transient,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Fatal(_) => ErrorCategory::Fatal,
            Self::Json(_) => ErrorCategory::Serialization,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => ErrorCategory::Transient,
        }
    }

    /// A metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::Conflict(_) => "conflict",
            Self::NoDeleteTarget(_) => "no_delete_target",
            Self::Script(_) => "script_error",
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config_error",
            Self::Fatal(_) => "fatal",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres_error",
        }
    }
}

/// Check a Postgres error's SQLSTATE for transient classes.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx), includes serialization failures
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for sink operations.
pub type Result<T> = std::result::Result<T, SiltError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SiltError::bad_request("missing 'updated' field");
        assert!(err.to_string().contains("bad request"));
        assert!(err.to_string().contains("updated"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(SiltError::transient("serialization failure").is_retriable());
        assert!(SiltError::timeout("apply after 60s").is_retriable());

        assert!(!SiltError::bad_request("x").is_retriable());
        assert!(!SiltError::schema_mismatch("x").is_retriable());
        assert!(!SiltError::script("x").is_retriable());
        assert!(!SiltError::config("x").is_retriable());
        assert!(!SiltError::fatal("x").is_retriable());
    }

    #[test]
    fn test_category() {
        assert_eq!(
            SiltError::bad_request("x").category(),
            ErrorCategory::Request
        );
        assert_eq!(
            SiltError::schema_mismatch("x").category(),
            ErrorCategory::Schema
        );
        assert_eq!(SiltError::transient("x").category(), ErrorCategory::Transient);
        assert_eq!(SiltError::fatal("x").category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(SiltError::conflict("x").error_code(), "conflict");
        assert_eq!(SiltError::timeout("x").error_code(), "timeout");
        assert_eq!(
            SiltError::NoDeleteTarget("src".into()).error_code(),
            "no_delete_target"
        );
    }
}
