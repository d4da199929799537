//! Error taxonomy shared by accessors, the reconciler and the dispatcher.

use serde::{Deserialize, Serialize};

/// Errors surfaced by cluster accessors and reconcile passes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency version mismatch.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network, throttling, timeouts, server-side hiccups.
    #[error("transient: {0}")]
    Transient(String),
    /// Not fixable by retrying this key (malformed key, forbidden, invalid object).
    #[error("fatal: {0}")]
    Fatal(String),
    /// Broken process configuration (credentials, unknown kind). Stops the subsystem.
    #[error("config: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    AlreadyExists,
    Conflict,
    Transient,
    Fatal,
    Config,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::AlreadyExists => "already_exists",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Config => "config",
        }
    }
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::AlreadyExists(_) => ErrorClass::AlreadyExists,
            SyncError::Conflict(_) => ErrorClass::Conflict,
            SyncError::Transient(_) => ErrorClass::Transient,
            SyncError::Fatal(_) => ErrorClass::Fatal,
            SyncError::Config(_) => ErrorClass::Config,
        }
    }

    /// Whether the same key should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Fatal(_) | SyncError::Config(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Fatal(format!("malformed object: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(SyncError::NotFound("x".into()).is_retryable());
        assert!(SyncError::Conflict("x".into()).is_retryable());
        assert!(SyncError::Transient("x".into()).is_retryable());
        assert!(SyncError::AlreadyExists("x".into()).is_retryable());
        assert!(!SyncError::Fatal("x".into()).is_retryable());
        assert!(!SyncError::Config("x".into()).is_retryable());
    }

    #[test]
    fn display_carries_class_prefix() {
        let e = SyncError::Conflict("rv 3 != 4".into());
        assert_eq!(e.to_string(), "conflict: rv 3 != 4");
        assert_eq!(e.class().as_str(), "conflict");
    }
}
