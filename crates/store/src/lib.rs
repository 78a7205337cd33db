//! Versioned calibration store.
//!
//! Ties the metadata indexes, the artifact cache and the remote artifact
//! service together:
//! - Registration assigns the next version in a calibration's family
//! - Retrieval resolves a calibration to a cached file, fetching on a miss
//! - Selection maps observation metadata to one calibration
//! - Sync copies new remote records into the local index

pub mod error;
pub mod selector;
pub mod store;
pub mod version;

pub use error::{StoreError, StoreResult};
pub use selector::{CalibrationSelector, NearestInTimeSelector, Observation, select};
pub use store::{CalibrationStore, ResolvedCalibration};
pub use version::VersionAssigner;

pub use calstore_client::{ArtifactSource, DirectorySource, HttpArtifactClient};
pub use calstore_core::{
    CalibrationRecord, CalibrationRef, IdStrategy, IndexTarget, MetadataConfig, NewCalibration,
    ObsTime, Origin, RemoteConfig, StoreConfig, Version, VersionFamily,
};
pub use calstore_metadata::{
    CalibrationQuery, ImportKind, MetadataIndex, OrderBy, PostgresIndex, SortDirection,
    SqliteIndex,
};
pub use calstore_storage::{CacheLookup, CalibrationCache, WritePolicy};
