//! Error types for termstore.

use std::fmt;
use std::io;

/// The result type used throughout termstore.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for termstore operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A file is malformed or failed an integrity check.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Components were wired together inconsistently.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The component is in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A single-writer component was entered while another call was active.
    #[error("Concurrent use: {0}")]
    ConcurrentUse(String),

    /// A background spill failed; raised at the next synchronization point.
    #[error("Background failure: {source}{}", Suppressed(.suppressed))]
    Background {
        /// The first failure observed.
        source: Box<Error>,
        /// Later failures, kept so none are lost.
        suppressed: Vec<Error>,
    },
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new concurrent use error.
    pub fn concurrent_use(msg: impl Into<String>) -> Self {
        Error::ConcurrentUse(msg.into())
    }

    /// Folds a list of captured failures into one error.
    ///
    /// The first failure becomes the source, the rest are attached as suppressed.
    /// Returns `None` when the list is empty.
    pub fn condense(mut errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let first = errors.remove(0);
        Some(Error::Background { source: Box::new(first), suppressed: errors })
    }

    /// Failures attached to a background error after the first one.
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Error::Background { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

struct Suppressed<'a>(&'a [Error]);

impl fmt::Display for Suppressed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " ({} suppressed:", self.0.len())?;
        for err in self.0 {
            write!(f, " [{}]", err)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("bad header");
        assert_eq!(err.to_string(), "Data corruption: bad header");

        let err = Error::concurrent_use("writer busy");
        assert_eq!(err.to_string(), "Concurrent use: writer busy");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_condense_keeps_every_cause() {
        assert!(Error::condense(Vec::new()).is_none());

        let err = Error::condense(vec![
            Error::corruption("first"),
            Error::invalid_state("second"),
            Error::invalid_state("third"),
        ])
        .unwrap();

        assert_eq!(err.suppressed().len(), 2);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("2 suppressed"));
        assert!(text.contains("third"));
    }
}
