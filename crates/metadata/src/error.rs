//! Metadata index error types.

use thiserror::Error;

/// Metadata index operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate calibration id: {0}")]
    DuplicateId(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Another writer claimed the version first; recompute and retry.
    #[error("version conflict in {0}")]
    VersionConflict(String),

    #[error("version family {0} already holds 999 versions")]
    VersionExhausted(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// True when the operation may succeed if recomputed and retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetadataError::VersionConflict(_))
    }
}

impl From<calstore_core::Error> for MetadataError {
    fn from(err: calstore_core::Error) -> Self {
        use calstore_core::Error as Core;
        match err {
            Core::Config(msg) => MetadataError::Config(msg),
            Core::InvalidMetadata(msg) => MetadataError::InvalidMetadata(msg),
            other => MetadataError::InvalidMetadata(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(err: serde_json::Error) -> Self {
        MetadataError::Serialization(err.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Unique constraints declared on the calibrations table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UniqueConstraint {
    Id,
    Filename,
    Version,
}

pub(crate) const ID_CONSTRAINT: &str = "calibrations_id_key";
pub(crate) const FILENAME_CONSTRAINT: &str = "calibrations_filename_key";
pub(crate) const VERSION_CONSTRAINT: &str = "calibrations_version_key";

/// Identify which unique constraint a database error violated, if any.
pub(crate) fn unique_violation(err: &sqlx::Error) -> Option<UniqueConstraint> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };

    // PostgreSQL error code 23505 = unique_violation
    if db_err.code().as_deref() == Some("23505") {
        return match db_err.constraint() {
            Some(ID_CONSTRAINT) => Some(UniqueConstraint::Id),
            Some(FILENAME_CONSTRAINT) => Some(UniqueConstraint::Filename),
            Some(VERSION_CONSTRAINT) => Some(UniqueConstraint::Version),
            _ => None,
        };
    }

    // SQLite: "UNIQUE constraint failed: calibrations.instrument_name, calibrations.filename"
    let msg = db_err.message();
    if !msg.contains("UNIQUE constraint") {
        return None;
    }
    if msg.contains("calibrations.version_family") {
        Some(UniqueConstraint::Version)
    } else if msg.contains("calibrations.filename") {
        Some(UniqueConstraint::Filename)
    } else if msg.contains("calibrations.id") {
        Some(UniqueConstraint::Id)
    } else {
        None
    }
}

/// SQLite lock contention (SQLITE_BUSY / SQLITE_BUSY_SNAPSHOT).
pub(crate) fn is_lock_contention(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    matches!(db_err.code().as_deref(), Some("5") | Some("517"))
        || db_err.message().contains("database is locked")
}

/// Map an insert failure to the matching error kind.
pub(crate) fn insert_error(err: sqlx::Error, id: &str, filename: &str) -> MetadataError {
    match unique_violation(&err) {
        Some(UniqueConstraint::Id) => MetadataError::DuplicateId(id.to_string()),
        Some(UniqueConstraint::Filename) => {
            MetadataError::Constraint(format!("filename {filename} is already indexed"))
        }
        Some(UniqueConstraint::Version) => MetadataError::VersionConflict(format!(
            "version already assigned for {filename}"
        )),
        None if is_lock_contention(&err) => {
            MetadataError::Unavailable(format!("index is locked: {err}"))
        }
        None => MetadataError::Database(err),
    }
}

/// Map a failure inside the versioned read-then-insert unit of work.
pub(crate) fn versioned_error(err: sqlx::Error, id: &str, filename: &str) -> MetadataError {
    if is_lock_contention(&err) {
        return MetadataError::VersionConflict(format!("index busy while versioning {filename}"));
    }
    insert_error(err, id, filename)
}
