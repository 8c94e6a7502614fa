//! Error taxonomy shared by every core component
//!
//! Each variant maps to one [`ErrorKind`] tag so the tool boundary can report
//! a stable machine-readable category together with the message.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Result alias for core operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or contradictory configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed input rejected before any I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Attachment transfer failed; partial artifacts have been removed.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// No extractor exists for the attachment's format.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// An outbound call exceeded its time bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A resolved path would leave the attachment root.
    #[error("Path escapes attachment root: {}", path.display())]
    PathEscape { path: PathBuf },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A collaborator (Jira, Ollama, pdftotext) answered with a failure.
    #[error("{service} request failed: {message}")]
    Backend {
        service: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error category reported to tool callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Transfer,
    UnsupportedFormat,
    Timeout,
    PathEscape,
    NotFound,
    Backend,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Transfer => "transfer",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PathEscape => "path_escape",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Backend => "backend",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::PathEscape { .. } => ErrorKind::PathEscape,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller may retry the same operation.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Backend { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn backend(service: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Error::Backend {
            service,
            message: message.into(),
            retryable,
        }
    }
}
