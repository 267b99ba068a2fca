//! Errors raised by the content layer.

use crate::record::ContentHash;

/// Content layer failures.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// The digest of the supplied bytes disagrees with the claimed hash.
    #[error("content mismatch: expected {expected}, computed {actual}")]
    ContentMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("content {0} not found")]
    ContentNotFound(ContentHash),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid content hash: {0}")]
    InvalidHash(String),
    #[error("invalid content record: {0}")]
    InvalidRecord(String),
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),
}

impl FileError {
    /// Precondition failures reported through the storage error channel.
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        FileError::StorageIo(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            message.into(),
        ))
    }
}
