use std::io;

use thiserror::Error;

/// Unified error type for the storage engine.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from disk operations.
    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    /// Data corruption detected (CRC mismatch, bad format, etc).
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The device ran out of space during a flush or compaction.
    /// Writes stay halted until a later flush succeeds.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// A read exceeded its deadline and was abandoned.
    #[error("Read deadline exceeded")]
    Timeout,

    /// The engine has been closed.
    #[error("Engine is closed")]
    Closed,

    /// Rejected options or arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Classify an IO error, mapping "disk full" to `Capacity`.
    pub fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::StorageFull {
            Error::Capacity(e.to_string())
        } else {
            Error::Io(e)
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity(_))
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::from_io(e)
    }
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_full_maps_to_capacity() {
        let err: Error = io::Error::new(io::ErrorKind::StorageFull, "no space").into();
        assert!(err.is_capacity());

        let err = Error::from_io(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(matches!(err, Error::Io(_)));
    }
}
