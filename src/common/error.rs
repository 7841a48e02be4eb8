//! Error types for the storage engine.

use thiserror::Error;

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error the engine can report.
///
/// `Corrupt`, `CursorOverflow` and `Protocol` are never recovered from
/// internally. `Busy` is the only condition a caller may simply retry.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the database or WAL file, passed through unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk structure failed a structural check.
    #[error("database corrupt: {0}")]
    Corrupt(String),

    /// A tree descent went deeper than the hard depth bound.
    #[error("cursor overflow: descent to page {page} exceeds depth {depth}")]
    CursorOverflow { page: u32, depth: usize },

    /// A buffer or table could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// A lock is held by another connection.
    #[error("database is busy")]
    Busy,

    /// The WAL locking protocol could not make progress.
    #[error("WAL protocol error: {0}")]
    Protocol(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A key is too large to be stored on a single page.
    #[error("key of {size} bytes exceeds the {max} byte limit")]
    KeyTooLarge { size: usize, max: usize },

    /// An API was called in a state that does not allow it.
    #[error("misuse: {0}")]
    Misuse(&'static str),
}

impl Error {
    /// Build a `Corrupt` error from anything displayable.
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}
