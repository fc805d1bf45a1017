//! Error types for whorl.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! the [`WhorlError`] enum. The variants are grouped by how a caller is expected
//! to react to them:
//!
//! - **Fatal**: [`WhorlError::Format`] means the on-disk data cannot be read by
//!   this build. It is surfaced unchanged.
//! - **Programming errors**: [`WhorlError::ReaderClosed`],
//!   [`WhorlError::ReadTooFar`] and [`WhorlError::NoQualityAvailable`] signal
//!   misuse of a reader or matcher.
//! - **Recoverable**: term misses, lock contention, empty or out-of-date
//!   indexes and time limits. See [`WhorlError::is_recoverable`].
//!
//! # Examples
//!
//! ```
//! use whorl::error::{Result, WhorlError};
//!
//! fn open_segment() -> Result<()> {
//!     Err(WhorlError::format("bad magic number"))
//! }
//!
//! let err = open_segment().unwrap_err();
//! assert!(!err.is_recoverable());
//! assert_eq!(err.to_string(), "Format error: bad magic number");
//! ```

use std::io;

use thiserror::Error;

/// The main error type for whorl operations.
#[derive(Error, Debug)]
pub enum WhorlError {
    /// I/O errors from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data is not readable by this build (bad magic, version, checksum).
    #[error("Format error: {0}")]
    Format(String),

    /// A file or an ordinal position does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A term lookup missed.
    #[error("Term not found: {field}:{term}")]
    TermNotFound { field: String, term: String },

    /// An operation was attempted on a closed reader.
    #[error("Reader is closed")]
    ReaderClosed,

    /// A matcher was advanced or read after it became inactive.
    #[error("Read past the end of a matcher")]
    ReadTooFar,

    /// Quality bounds were requested from a matcher that has none.
    #[error("Block quality is not available for this matcher")]
    NoQualityAvailable,

    /// Another writer holds the index lock.
    #[error("Lock error: {0}")]
    Lock(String),

    /// The index has no table of contents yet.
    #[error("Index is empty: {0}")]
    EmptyIndex(String),

    /// The handle refers to a generation that is no longer current.
    #[error("Index is out of date: {0}")]
    OutOfDate(String),

    /// A time-limited collection ran out of time.
    #[error("Time limit exceeded")]
    TimeLimit,

    /// Index-related errors.
    #[error("Index error: {0}")]
    Index(String),

    /// Schema-related errors.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Query-related errors.
    #[error("Query error: {0}")]
    Query(String),

    /// Storage-related errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Binary serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with [`WhorlError`].
pub type Result<T> = std::result::Result<T, WhorlError>;

impl WhorlError {
    /// Create a new format error.
    pub fn format<S: Into<String>>(msg: S) -> Self {
        WhorlError::Format(msg.into())
    }

    /// Create a new not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        WhorlError::NotFound(msg.into())
    }

    /// Create a new term-not-found error.
    pub fn term_not_found<S: Into<String>>(field: S, term: &[u8]) -> Self {
        WhorlError::TermNotFound {
            field: field.into(),
            term: String::from_utf8_lossy(term).into_owned(),
        }
    }

    /// Create a new lock error.
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        WhorlError::Lock(msg.into())
    }

    /// Create a new empty-index error.
    pub fn empty_index<S: Into<String>>(msg: S) -> Self {
        WhorlError::EmptyIndex(msg.into())
    }

    /// Create a new out-of-date error.
    pub fn out_of_date<S: Into<String>>(msg: S) -> Self {
        WhorlError::OutOfDate(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        WhorlError::Index(msg.into())
    }

    /// Create a new schema error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        WhorlError::Schema(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        WhorlError::Query(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        WhorlError::Storage(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        WhorlError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        WhorlError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Whether the caller can reasonably continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WhorlError::NotFound(_)
                | WhorlError::TermNotFound { .. }
                | WhorlError::Lock(_)
                | WhorlError::EmptyIndex(_)
                | WhorlError::OutOfDate(_)
                | WhorlError::TimeLimit
        )
    }

    /// Whether this error indicates misuse of a reader or matcher.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            WhorlError::ReaderClosed | WhorlError::ReadTooFar | WhorlError::NoQualityAvailable
        )
    }

    /// Whether this error may be caused by a concurrent writer removing files.
    pub(crate) fn is_transient_io(&self) -> bool {
        matches!(
            self,
            WhorlError::Io(_) | WhorlError::NotFound(_) | WhorlError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = WhorlError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = WhorlError::term_not_found("title", b"alpha");
        assert_eq!(error.to_string(), "Term not found: title:alpha");

        let error = WhorlError::format("bad magic");
        assert_eq!(error.to_string(), "Format error: bad magic");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = WhorlError::from(io_error);

        match error {
            WhorlError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_recoverability() {
        assert!(WhorlError::TimeLimit.is_recoverable());
        assert!(WhorlError::lock("WRITELOCK").is_recoverable());
        assert!(WhorlError::empty_index("main").is_recoverable());
        assert!(!WhorlError::format("x").is_recoverable());

        assert!(WhorlError::ReaderClosed.is_programming_error());
        assert!(WhorlError::ReadTooFar.is_programming_error());
        assert!(WhorlError::NoQualityAvailable.is_programming_error());
        assert!(!WhorlError::TimeLimit.is_programming_error());
    }
}
