//! Error types for the block store.

use thiserror::Error;

/// Result type alias for block-store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for block-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors from the local-directory backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by a cloud object-store backend.
    #[error("backend error: {0}")]
    Backend(#[from] object_store::Error),

    /// The requested key does not exist in the bucket.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// The bucket URL could not be parsed or names an unknown scheme.
    #[error("unsupported bucket URL: {url}")]
    UnsupportedUrl {
        /// The offending URL.
        url: String,
    },

    /// A mutation was attempted through a read-only handle.
    #[error("store is read-only: {op}")]
    ReadOnly {
        /// The operation that was refused.
        op: &'static str,
    },

    /// A hash string could not be decoded.
    #[error("invalid block hash: {0}")]
    InvalidHash(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// True when the error represents a missing key rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
