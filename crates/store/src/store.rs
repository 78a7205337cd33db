//! The calibration store: registration, retrieval, selection and sync.

use crate::error::{StoreError, StoreResult, remote_index_error};
use crate::selector::{CalibrationSelector, select};
use crate::version::VersionAssigner;
use bytes::Bytes;
use calstore_client::ArtifactSource;
use calstore_core::{
    CalibrationRecord, CalibrationRef, IndexTarget, NewCalibration, Origin, StoreConfig, Version,
    VersionFamily,
};
use calstore_metadata::{
    CalibrationQuery, ImportKind, MetadataError, MetadataIndex, MetadataResult, OrderBy,
    SortDirection,
};
use calstore_storage::{CacheLookup, CalibrationCache, WritePolicy};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::instrument;

/// A calibration that is present in the local cache.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedCalibration {
    pub path: PathBuf,
    pub record: CalibrationRecord,
}

/// Calibration store for one instrument.
///
/// Owns the local index and artifact cache, and talks to the remote index
/// and artifact service when they are configured. The remote index is
/// connected on first use.
pub struct CalibrationStore {
    config: StoreConfig,
    family: VersionFamily,
    cache: CalibrationCache,
    local: Arc<dyn MetadataIndex>,
    remote: OnceCell<Arc<dyn MetadataIndex>>,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    assigner: VersionAssigner,
    closed: AtomicBool,
}

impl CalibrationStore {
    /// Open the store described by `config`, creating the cache and database
    /// directories on first use.
    #[instrument(skip(config), fields(instrument = %config.instrument_name))]
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let family = config.version_family()?;
        let cache = calstore_storage::from_config(&config).await?;
        let local = calstore_metadata::from_config(&config.local_index(), family).await?;
        let artifacts = calstore_client::from_config(&config.remote)?;
        tracing::info!(
            cache_root = %config.cache_root.display(),
            local_index = %config.local_index_path().display(),
            remote_index = config.remote.index.is_some(),
            artifact_source = artifacts.is_some(),
            "opened calibration store"
        );
        Self::from_parts(config, cache, local, artifacts)
    }

    /// Assemble a store from already opened components.
    ///
    /// `local` must key versions by the same family fields as `config`.
    pub fn from_parts(
        config: StoreConfig,
        cache: CalibrationCache,
        local: Arc<dyn MetadataIndex>,
        artifacts: Option<Arc<dyn ArtifactSource>>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let family = config.version_family()?;
        if local.version_family() != &family {
            return Err(StoreError::Config(format!(
                "local index versions by {:?} but the store is configured for {:?}",
                local.version_family().fields(),
                family.fields()
            )));
        }
        let assigner = VersionAssigner::new(config.max_version_retries, config.id_strategy);
        Ok(Self {
            config,
            family,
            cache,
            local,
            remote: OnceCell::new(),
            artifacts,
            assigner,
            closed: AtomicBool::new(false),
        })
    }

    /// Use an already connected remote index instead of `remote.index`.
    pub fn with_remote_index(mut self, remote: Arc<dyn MetadataIndex>) -> Self {
        self.remote = OnceCell::from(remote);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn instrument_name(&self) -> &str {
        &self.config.instrument_name
    }

    pub fn version_family(&self) -> &VersionFamily {
        &self.family
    }

    pub fn cache(&self) -> &CalibrationCache {
        &self.cache
    }

    pub fn local_index(&self) -> &Arc<dyn MetadataIndex> {
        &self.local
    }

    /// Whether a remote index is connected or configured.
    pub fn has_remote(&self) -> bool {
        self.remote.initialized() || self.config.remote.index.is_some()
    }

    /// Register a calibration under the configured origin.
    pub async fn register(&self, draft: NewCalibration, data: Bytes) -> StoreResult<CalibrationRecord> {
        let origin = self.config.origin.clone();
        self.register_calibration(draft, data, origin).await
    }

    /// Cache `data` and index it as the next version of its family.
    ///
    /// The file is written first. If indexing then fails the file stays in
    /// the cache unindexed and the error is returned.
    #[instrument(skip(self, draft, data), fields(filename = %draft.filename, origin = %origin, size = data.len()))]
    pub async fn register_calibration(
        &self,
        draft: NewCalibration,
        data: Bytes,
        origin: Origin,
    ) -> StoreResult<CalibrationRecord> {
        self.ensure_open()?;
        draft.validate()?;
        self.family.key(&draft)?;

        let instrument = self.instrument_name();
        let policy = if self.config.use_cached {
            WritePolicy::KeepExisting
        } else {
            WritePolicy::Overwrite
        };
        let path = self
            .cache
            .store(instrument, &draft.filename, data, policy)
            .await?;

        match self
            .assigner
            .assign_and_insert(&draft, instrument, &origin, self.local.as_ref())
            .await
        {
            Ok(record) => {
                tracing::info!(
                    id = %record.id,
                    version = %record.version,
                    path = %path.display(),
                    "registered calibration"
                );
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "indexing failed, cached file left unindexed"
                );
                Err(e)
            }
        }
    }

    /// Version the next registration of `draft` under `origin` would get.
    pub async fn generate_calibration_version(
        &self,
        draft: &NewCalibration,
        origin: &Origin,
    ) -> StoreResult<Version> {
        self.ensure_open()?;
        self.assigner
            .generate_calibration_version(draft, self.instrument_name(), origin, self.local.as_ref())
            .await
    }

    /// Resolve a calibration to a cached file, honouring `use_cached`.
    pub async fn get_calibration(
        &self,
        reference: impl Into<CalibrationRef>,
    ) -> StoreResult<ResolvedCalibration> {
        self.get_calibration_with(reference, self.config.use_cached)
            .await
    }

    /// Resolve a calibration to a cached file.
    ///
    /// The local index is consulted first, then the remote one; a record
    /// found remotely is imported. With `use_cached` a cached file is
    /// returned as is, otherwise the artifact is fetched again and replaces
    /// the cached copy.
    #[instrument(skip(self, reference), fields(reference = tracing::field::Empty))]
    pub async fn get_calibration_with(
        &self,
        reference: impl Into<CalibrationRef>,
        use_cached: bool,
    ) -> StoreResult<ResolvedCalibration> {
        self.ensure_open()?;
        let reference = reference.into();
        tracing::Span::current().record("reference", tracing::field::display(&reference));

        let record = self.lookup(&reference).await?;
        let instrument = record.instrument_name.as_str();

        if use_cached
            && let CacheLookup::Hit(path) = self.cache.resolve(instrument, &record.filename).await?
        {
            tracing::debug!(path = %path.display(), "cache hit");
            return Ok(ResolvedCalibration { path, record });
        }

        tracing::debug!(filename = %record.filename, use_cached, "fetching artifact");
        let source = self.artifacts.as_ref().ok_or_else(|| {
            StoreError::Config(format!(
                "{} is not cached and no artifact source is configured",
                record.filename
            ))
        })?;
        let data = self
            .with_timeout(
                "artifact fetch",
                source.fetch_artifact(instrument, &record.filename),
            )
            .await??;
        let path = self
            .cache
            .store(instrument, &record.filename, data, WritePolicy::Overwrite)
            .await?;
        Ok(ResolvedCalibration { path, record })
    }

    /// Select a calibration for `input` and return its cached path.
    pub async fn select_and_get_calibration<S>(
        &self,
        input: &S::Input,
        selector: &S,
    ) -> StoreResult<PathBuf>
    where
        S: CalibrationSelector + ?Sized,
    {
        Ok(self
            .select_and_get_calibration_record(input, selector)
            .await?
            .path)
    }

    /// Select a calibration for `input` and return its cached path and
    /// record.
    ///
    /// Selection runs against the index named by `selection_index`.
    #[instrument(skip_all, fields(selector = selector.name()))]
    pub async fn select_and_get_calibration_record<S>(
        &self,
        input: &S::Input,
        selector: &S,
    ) -> StoreResult<ResolvedCalibration>
    where
        S: CalibrationSelector + ?Sized,
    {
        self.ensure_open()?;
        let chosen = match self.config.selection_index {
            IndexTarget::Local => select(selector, input, self.local.as_ref()).await?,
            IndexTarget::Remote => {
                let remote = self.remote().await?;
                self.with_timeout("remote selection", select(selector, input, remote.as_ref()))
                    .await??
            }
        };
        self.get_calibration(CalibrationRef::Id(chosen.id)).await
    }

    /// Copy records added to the remote index since the last sync into the
    /// local index. Artifacts are not transferred.
    ///
    /// Returns the records that were new locally; an immediate second call
    /// returns nothing. A remote record that collides with a local one
    /// (same filename, or same version in its namespace) is logged and
    /// skipped so later records still arrive.
    #[instrument(skip(self))]
    pub async fn sync_from_remote(&self) -> StoreResult<Vec<CalibrationRecord>> {
        self.ensure_open()?;
        let remote = self.remote().await?;
        let watermark = self.local.get_last_imported().await?;

        let mut query = CalibrationQuery::new()
            .instrument(self.instrument_name())
            .order_by(OrderBy::LastUpdated, SortDirection::Asc);
        if let Some(since) = watermark {
            query = query.updated_since(since);
        }
        let records = self.remote_call("remote query", remote.query(&query)).await?;

        let fetched = records.len();
        let mut inserted = Vec::new();
        let mut skipped = 0usize;
        for record in records {
            match self.local.import(&record, ImportKind::Synced).await {
                Ok(true) => inserted.push(record),
                Ok(false) => {}
                Err(e @ (MetadataError::Constraint(_) | MetadataError::VersionConflict(_))) => {
                    tracing::warn!(
                        id = %record.id,
                        filename = %record.filename,
                        version = %record.version,
                        error = %e,
                        "remote record collides with a local one, skipped"
                    );
                    skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(
            fetched,
            inserted = inserted.len(),
            skipped,
            "synced from remote index"
        );
        Ok(inserted)
    }

    /// Records on the remote index that the local index does not hold yet.
    pub async fn missing_local_entries(&self) -> StoreResult<Vec<CalibrationRecord>> {
        self.ensure_open()?;
        let remote = self.remote().await?;
        let query = CalibrationQuery::new().instrument(self.instrument_name());
        let records = self.remote_call("remote query", remote.query(&query)).await?;

        let mut missing = Vec::new();
        for record in records {
            if self.local.get_by_id(record.id).await?.is_none() {
                missing.push(record);
            }
        }
        Ok(missing)
    }

    /// Index files that are already in the cache without rewriting them.
    ///
    /// Records whose id is already indexed are skipped. A record whose file
    /// is not cached fails with `CalibrationNotFound`.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn index_cached_files(
        &self,
        records: &[CalibrationRecord],
    ) -> StoreResult<Vec<CalibrationRecord>> {
        self.ensure_open()?;
        let mut indexed = Vec::new();
        for record in records {
            if self.local.get_by_id(record.id).await?.is_some() {
                tracing::debug!(id = %record.id, "already indexed");
                continue;
            }
            let lookup = self
                .cache
                .resolve(&record.instrument_name, &record.filename)
                .await?;
            if !lookup.is_hit() {
                return Err(StoreError::CalibrationNotFound(format!(
                    "{}/{} is not in the cache",
                    record.instrument_name, record.filename
                )));
            }
            indexed.push(self.local.insert(record).await?);
        }
        tracing::info!(indexed = indexed.len(), "indexed cached files");
        Ok(indexed)
    }

    /// Number of records in the local index.
    pub async fn count(&self) -> StoreResult<u64> {
        self.ensure_open()?;
        Ok(self.local.count().await?)
    }

    /// Path a calibration would be cached at.
    pub fn cache_path(&self, filename: &str) -> StoreResult<PathBuf> {
        Ok(self.cache.path_for(self.instrument_name(), filename)?)
    }

    pub fn cache_root(&self) -> &Path {
        self.cache.root()
    }

    /// Close the local and remote index handles. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local.close().await;
        if let Some(remote) = self.remote.get() {
            remote.close().await;
        }
        tracing::debug!("closed calibration store");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::IndexUnavailable("calibration store is closed".into()));
        }
        Ok(())
    }

    async fn lookup(&self, reference: &CalibrationRef) -> StoreResult<CalibrationRecord> {
        let instrument = self.instrument_name();
        let local = match reference {
            CalibrationRef::Id(id) => self.local.get_by_id(*id).await?,
            CalibrationRef::Filename(name) => self.local.get_by_filename(instrument, name).await?,
            CalibrationRef::Record(record) => self.local.get_by_id(record.id).await?,
        };
        if let Some(record) = local {
            return Ok(record);
        }
        if !self.has_remote() {
            return Err(StoreError::CalibrationNotFound(reference.to_string()));
        }

        let remote = self.remote().await?;
        let found = match reference {
            CalibrationRef::Id(id) => self.remote_call("remote lookup", remote.get_by_id(*id)).await?,
            CalibrationRef::Filename(name) => {
                self.remote_call("remote lookup", remote.get_by_filename(instrument, name))
                    .await?
            }
            CalibrationRef::Record(record) => {
                self.remote_call("remote lookup", remote.get_by_id(record.id))
                    .await?
            }
        };
        let record = found.ok_or_else(|| StoreError::CalibrationNotFound(reference.to_string()))?;
        if self.local.import(&record, ImportKind::Fetched).await? {
            tracing::debug!(id = %record.id, "imported remote record");
        }
        Ok(record)
    }

    async fn remote(&self) -> StoreResult<&Arc<dyn MetadataIndex>> {
        if let Some(remote) = self.remote.get() {
            return Ok(remote);
        }
        let config = self
            .config
            .remote
            .index
            .as_ref()
            .ok_or_else(|| StoreError::Config("no remote index configured".into()))?;
        self.remote
            .get_or_try_init(|| async {
                let index = self
                    .remote_call(
                        "remote index connect",
                        calstore_metadata::from_config(config, self.family.clone()),
                    )
                    .await?;
                tracing::info!("connected to remote index");
                Ok::<_, StoreError>(index)
            })
            .await
    }

    /// Run a remote index call under the configured timeout.
    async fn remote_call<T>(
        &self,
        what: &str,
        call: impl Future<Output = MetadataResult<T>>,
    ) -> StoreResult<T> {
        self.with_timeout(what, call)
            .await?
            .map_err(remote_index_error)
    }

    async fn with_timeout<T>(&self, what: &str, call: impl Future<Output = T>) -> StoreResult<T> {
        let timeout = self.config.remote.timeout();
        tokio::time::timeout(timeout, call).await.map_err(|_| {
            StoreError::RemoteUnavailable(format!("{what} timed out after {timeout:?}"))
        })
    }
}
