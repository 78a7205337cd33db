//! Calibration store error types.

use calstore_client::ClientError;
use calstore_metadata::MetadataError;
use calstore_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the calibration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A required field (version-family or otherwise) is missing or malformed.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("version exhausted: {0}")]
    VersionExhausted(String),

    #[error("duplicate calibration id: {0}")]
    DuplicateId(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("cache conflict: {} already holds different content", .0.display())]
    CacheConflict(PathBuf),

    /// Absent from both the local and the remote index.
    #[error("calibration not found: {0}")]
    CalibrationNotFound(String),

    /// The selection pipeline produced no result.
    #[error("no calibration found by {0}")]
    NoCalibrationFound(String),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("local index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<calstore_core::Error> for StoreError {
    fn from(err: calstore_core::Error) -> Self {
        use calstore_core::Error as Core;
        match err {
            Core::Config(msg) => StoreError::Config(msg),
            Core::InvalidMetadata(msg) => StoreError::InvalidMetadata(msg),
            other => StoreError::InvalidMetadata(other.to_string()),
        }
    }
}

impl From<MetadataError> for StoreError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(msg) => StoreError::CalibrationNotFound(msg),
            MetadataError::DuplicateId(id) => StoreError::DuplicateId(id),
            MetadataError::Constraint(msg) => StoreError::ConstraintViolation(msg),
            MetadataError::VersionConflict(msg) => StoreError::ConstraintViolation(msg),
            MetadataError::VersionExhausted(msg) => StoreError::VersionExhausted(msg),
            MetadataError::InvalidMetadata(msg) => StoreError::InvalidMetadata(msg),
            MetadataError::Unavailable(msg) => StoreError::IndexUnavailable(msg),
            MetadataError::Config(msg) => StoreError::Config(msg),
            MetadataError::Io(e) => StoreError::Io(e),
            MetadataError::Database(e) => StoreError::Internal(format!("database error: {e}")),
            MetadataError::Serialization(msg) | MetadataError::Internal(msg) => {
                StoreError::Internal(msg)
            }
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(name) => StoreError::CalibrationNotFound(name),
            StorageError::Io(e) => StoreError::Io(e),
            StorageError::InvalidKey(msg) => StoreError::InvalidMetadata(msg),
            StorageError::CacheConflict { path } => StoreError::CacheConflict(path),
            StorageError::Config(msg) => StoreError::Config(msg),
        }
    }
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(name) => StoreError::CalibrationNotFound(name),
            ClientError::InvalidUrl(msg) => StoreError::Config(msg),
            ClientError::Io(e) => StoreError::Io(e),
            other @ (ClientError::Unavailable(_)
            | ClientError::Status { .. }
            | ClientError::Transport(_)) => StoreError::RemoteUnavailable(other.to_string()),
        }
    }
}

/// Map an error from the remote index. Failures to reach it become
/// `RemoteUnavailable`; everything else keeps its kind.
pub(crate) fn remote_index_error(err: MetadataError) -> StoreError {
    match err {
        MetadataError::Database(e) => StoreError::RemoteUnavailable(e.to_string()),
        MetadataError::Unavailable(msg) => StoreError::RemoteUnavailable(msg),
        MetadataError::Io(e) => StoreError::RemoteUnavailable(e.to_string()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_errors_keep_their_kind() {
        assert!(matches!(
            StoreError::from(MetadataError::VersionExhausted("dark".into())),
            StoreError::VersionExhausted(_)
        ));
        assert!(matches!(
            StoreError::from(MetadataError::DuplicateId("x".into())),
            StoreError::DuplicateId(_)
        ));
        assert!(matches!(
            StoreError::from(MetadataError::Constraint("x".into())),
            StoreError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn test_remote_failures_become_unavailable() {
        assert!(matches!(
            remote_index_error(MetadataError::Unavailable("pool closed".into())),
            StoreError::RemoteUnavailable(_)
        ));
        assert!(matches!(
            remote_index_error(MetadataError::InvalidMetadata("cal_type".into())),
            StoreError::InvalidMetadata(_)
        ));
        assert!(matches!(
            StoreError::from(ClientError::Unavailable("timeout".into())),
            StoreError::RemoteUnavailable(_)
        ));
        assert!(matches!(
            StoreError::from(ClientError::NotFound("hispec/a.fits".into())),
            StoreError::CalibrationNotFound(_)
        ));
    }
}
