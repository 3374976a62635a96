//! Error types for the folder driver.

use thiserror::Error;

use bucketfs_store::StoreError;

/// Result type alias for folder operations.
pub type FolderResult<T> = Result<T, FolderError>;

/// Error variants for folder operations.
#[derive(Debug, Error)]
pub enum FolderError {
    /// Error from the underlying block store.
    #[error("block store error: {0}")]
    Store(#[from] StoreError),

    /// A manifest failed to (de)serialise.
    #[error("manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// One or more blocks of a file could not be obtained.
    #[error("missing block data for {file}")]
    MissingBlocks {
        /// The affected file.
        file: String,
    },

    /// The external transfer collaborator failed to produce a block.
    #[error("block fetch failed: {0}")]
    Fetch(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl FolderError {
    /// True when the error is a cancellation, either ours or the store's.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            FolderError::Cancelled | FolderError::Store(StoreError::Cancelled)
        )
    }
}
