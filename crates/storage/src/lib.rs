//! Local artifact cache for calibration files.
//!
//! This crate provides:
//! - Per-instrument cache layout under `<cache_root>/calibrations`
//! - Hit/miss resolution without network I/O
//! - Idempotent, atomic artifact writes serialized per target path
//! - SHA-256 checksums of cached artifacts

pub mod cache;
pub mod error;

pub use cache::{CacheLookup, CalibrationCache, WritePolicy};
pub use error::{StorageError, StorageResult};

use calstore_core::StoreConfig;

/// Open the artifact cache described by a store configuration and make
/// sure the instrument's subtree exists.
pub async fn from_config(config: &StoreConfig) -> StorageResult<CalibrationCache> {
    config
        .validate()
        .map_err(|e| StorageError::Config(e.to_string()))?;
    let cache = CalibrationCache::new(config.calibrations_dir()).await?;
    cache.ensure_layout(&config.instrument_name).await?;
    Ok(cache)
}
