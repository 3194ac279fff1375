use std::error::Error;
use std::io;
use thiserror::Error;

/// An error related to storage operations (reads, writes...).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Error from the OS I/O layer.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Error related to data corruption.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    /// A term exceeds the maximum canonical serialization size.
    #[error("The term is too large to be stored (max {max} bytes, got {actual})")]
    TermTooLarge {
        /// The configured maximum.
        max: usize,
        /// The canonical size of the rejected term.
        actual: usize,
    },
    /// An IRI that cannot be stored (contains NUL or is not absolute).
    #[error("Invalid IRI: {0}")]
    InvalidIri(String),
    /// The store has been closed or marked read-only after a suspected corruption.
    #[error("The store is not writable: {0}")]
    ReadOnly(String),
    #[doc(hidden)]
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl From<StorageError> for io::Error {
    #[inline]
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Io(error) => error,
            StorageError::Corruption(error) => error.into(),
            StorageError::Other(error) => Self::new(io::ErrorKind::Other, error),
            StorageError::TermTooLarge { .. } | StorageError::InvalidIri(_) => {
                Self::new(io::ErrorKind::InvalidInput, error.to_string())
            }
            StorageError::ReadOnly(_) => Self::new(io::ErrorKind::PermissionDenied, error.to_string()),
        }
    }
}

/// An error returned if some content in the database is corrupted.
#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl CorruptionError {
    /// Builds an error from a source error.
    #[inline]
    pub(crate) fn new(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self::Other(error.into())
    }

    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }
}

impl From<CorruptionError> for io::Error {
    #[inline]
    fn from(error: CorruptionError) -> Self {
        Self::new(io::ErrorKind::InvalidData, error)
    }
}
