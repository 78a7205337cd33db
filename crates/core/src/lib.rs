//! Core domain types and shared logic for the calibration store.
//!
//! This crate defines the data model used across all other crates:
//! - Calibration records, registration drafts and references
//! - Versions and version-family keys
//! - Timestamp normalization
//! - Archive naming rules
//! - Content hashing and configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod koa;
pub mod record;
pub mod timestamp;
pub mod version;

pub use config::{IndexTarget, MetadataConfig, PgSslMode, RemoteConfig, StoreConfig};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use koa::{koa_filehandle, koa_filepath, koa_id, koa_id_timestamp};
pub use record::{
    Attributes, CalibrationRecord, CalibrationRef, FieldSource, IdStrategy, NewCalibration,
    Origin, RESERVED_FIELDS, is_valid_uuid_v4,
};
pub use timestamp::{ObsTime, format_last_updated, normalize_timestamp, now_utc, parse_last_updated};
pub use version::{FamilyKey, MAX_VERSION, Version, VersionFamily};
