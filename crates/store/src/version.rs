//! Version assignment with per-namespace serialization and race retries.

use crate::error::{StoreError, StoreResult};
use calstore_core::{CalibrationRecord, IdStrategy, NewCalibration, Origin, Version};
use calstore_metadata::{MetadataError, MetadataIndex};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Base delay between attempts after losing a version race.
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Assigns versions to new calibrations and inserts them.
///
/// Registrations to one (instrument, family, origin) namespace are
/// serialized inside the process. Writers in other processes are caught by
/// the index transaction; the loser recomputes and tries again.
pub struct VersionAssigner {
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_attempts: u32,
    ids: IdStrategy,
}

impl VersionAssigner {
    pub fn new(max_attempts: u32, ids: IdStrategy) -> Self {
        Self {
            locks: DashMap::new(),
            max_attempts: max_attempts.max(1),
            ids,
        }
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.ids
    }

    /// Version the next sibling of `draft` would receive. Nothing is
    /// reserved, so a concurrent registration may take it first.
    pub async fn generate_calibration_version(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
        index: &dyn MetadataIndex,
    ) -> StoreResult<Version> {
        Ok(index.next_version(draft, instrument_name, origin).await?)
    }

    /// Assign the next free version to `draft` and insert it into `index`.
    ///
    /// Lost races are retried with a freshly computed version. Once the
    /// attempts run out the conflict surfaces as `ConstraintViolation`.
    #[instrument(skip(self, draft, index), fields(filename = %draft.filename, origin = %origin))]
    pub async fn assign_and_insert(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
        index: &dyn MetadataIndex,
    ) -> StoreResult<CalibrationRecord> {
        let family = index.version_family().key(draft)?;
        let namespace = family.namespace(instrument_name, origin);
        let lock = self.lock_for(&namespace);
        let result = {
            let _guard = lock.lock().await;
            self.insert_with_retries(draft, instrument_name, origin, index, &namespace)
                .await
        };
        drop(lock);
        // Namespaces include the observation time, so most are used once.
        self.locks.remove_if(&namespace, |_, m| Arc::strong_count(m) == 1);
        result
    }

    async fn insert_with_retries(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
        index: &dyn MetadataIndex,
        namespace: &str,
    ) -> StoreResult<CalibrationRecord> {
        let mut attempt = 1;
        loop {
            match index
                .insert_versioned(draft, instrument_name, origin, self.ids)
                .await
            {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        attempt,
                        namespace = %namespace,
                        error = %e,
                        "lost version race, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(MetadataError::VersionConflict(msg)) => {
                    return Err(StoreError::ConstraintViolation(format!(
                        "{msg} (gave up after {attempt} attempts)"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_for(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
