// src/error.rs

//! Crate-wide error type
//!
//! Every fallible library operation returns [`Result`]. The command layer wraps
//! these in `anyhow` with additional context.

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the migration engine and its connectors
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or stream failure described by a message
    #[error("I/O error: {0}")]
    IoError(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed remote payload or persisted record
    #[error("parse error: {0}")]
    ParseError(String),

    /// A remote object or configured entry does not exist
    #[error("not found: {0}")]
    NotFoundError(String),

    /// HTTP request to a remote system failed
    #[error("request failed: {0}")]
    DownloadError(String),

    /// Client or session could not be established
    #[error("initialization failed: {0}")]
    InitError(String),

    /// Configuration file is missing values or inconsistent
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A long-running remote operation did not finish in time
    #[error("timed out: {0}")]
    TimeoutError(String),

    /// A required argument was missing or empty
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The run must stop immediately
    #[error("migration aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// True for the abort signal, which must never be swallowed by per-revision handlers
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// True when the failure is a missing local file (attachment content, record)
    ///
    /// A remote object that does not exist is a [`Error::NotFoundError`] and
    /// does not count.
    pub fn is_file_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Shorthand for an [`Error::InvalidArgument`]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_distinct() {
        assert!(Error::Aborted("stop".into()).is_abort());
        assert!(!Error::ParseError("bad".into()).is_abort());
    }

    #[test]
    fn test_file_not_found_detection() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(io).is_file_not_found());
        assert!(!Error::NotFoundError("x".into()).is_file_not_found());
        assert!(!Error::DownloadError("500".into()).is_file_not_found());
    }
}
