//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Calibration cache errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not cached: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A different artifact is already cached under this name.
    #[error("cache conflict: {} already holds different content", .path.display())]
    CacheConflict { path: PathBuf },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
