//! Error taxonomy shared by the reconciliation pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation error types
///
/// Each variant maps onto an [`ErrorKind`], which is what the reconciler
/// records as a task's last error and what decides whether a retry happens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Instance lookup failed: {0}")]
    InstanceLookupFailed(String),

    #[error("Retryable failure: {0}")]
    Retryable(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedEvent(_) => ErrorKind::MalformedEvent,
            Self::InstanceLookupFailed(_) => ErrorKind::InstanceLookupFailed,
            Self::Retryable(_) | Self::Timeout(_) => ErrorKind::Retryable,
            Self::Permanent(_) | Self::Configuration(_) => ErrorKind::Permanent,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Classify an I/O error by its kind
    #[must_use]
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        let message = format!("{context}: {err}");
        if crate::resilience::retry::is_transient_io_error(err) {
            Self::Retryable(message)
        } else {
            Self::Permanent(message)
        }
    }
}

/// Coarse error classification recorded on tasks and dead-letter records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedEvent,
    InstanceLookupFailed,
    Retryable,
    Permanent,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InstanceLookupFailed | Self::Retryable)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedEvent => "malformed_event",
            Self::InstanceLookupFailed => "instance_lookup_failed",
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;
