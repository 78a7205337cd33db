//! Calibration store test utilities.

use bytes::Bytes;
use calstore::{
    CalibrationRecord, CalibrationStore, IdStrategy, MetadataConfig, MetadataIndex,
    NewCalibration, ObsTime, Origin, SqliteIndex, StoreConfig, VersionFamily,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const INSTRUMENT: &str = "hispec";

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "calstore=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A shared remote index plus an archive directory serving its artifacts.
#[allow(dead_code)]
pub struct RemoteFixture {
    pub index: Arc<SqliteIndex>,
    pub db_path: PathBuf,
    pub archive: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl RemoteFixture {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("remote").join("calibrations.db");
        let archive = temp_dir.path().join("archive");
        std::fs::create_dir_all(archive.join(INSTRUMENT)).expect("Failed to create archive");
        let index = SqliteIndex::new(&db_path, VersionFamily::default(), Duration::from_secs(5))
            .await
            .expect("Failed to open remote index");
        Self {
            index: Arc::new(index),
            db_path,
            archive,
            _temp_dir: temp_dir,
        }
    }

    /// Register a calibration on the remote side and place its file in the
    /// archive.
    pub async fn publish(&self, draft: NewCalibration, data: &[u8], origin: Origin) -> CalibrationRecord {
        std::fs::write(self.archive.join(INSTRUMENT).join(&draft.filename), data)
            .expect("Failed to write archive file");
        self.index
            .insert_versioned(&draft, INSTRUMENT, &origin, IdStrategy::Random)
            .await
            .expect("Failed to publish remote calibration")
    }

    /// Replace an archived artifact.
    pub fn rewrite(&self, filename: &str, data: &[u8]) {
        std::fs::write(self.archive.join(INSTRUMENT).join(filename), data)
            .expect("Failed to rewrite archive file");
    }

    pub fn remove(&self, filename: &str) {
        std::fs::remove_file(self.archive.join(INSTRUMENT).join(filename))
            .expect("Failed to remove archive file");
    }

    /// Point a store configuration at this remote.
    pub fn configure(&self, config: &mut StoreConfig) {
        config.remote.index = Some(MetadataConfig::sqlite(&self.db_path));
        config.remote.artifact_base_url = Some(format!("file://{}", self.archive.display()));
    }
}

/// A store in a temporary cache root.
#[allow(dead_code)]
pub struct TestStore {
    pub store: Arc<CalibrationStore>,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStore {
    pub async fn new() -> Self {
        Self::with(|_| {}).await
    }

    /// Open a store after adjusting its configuration.
    pub async fn with(adjust: impl FnOnce(&mut StoreConfig)) -> Self {
        init_tracing();
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = StoreConfig::new(temp_dir.path(), INSTRUMENT);
        adjust(&mut config);
        let store = CalibrationStore::open(config)
            .await
            .expect("Failed to open calibration store");
        Self {
            store: Arc::new(store),
            temp_dir,
        }
    }

    /// A store attached to `remote`.
    pub async fn with_remote(remote: &RemoteFixture) -> Self {
        Self::with(|config| remote.configure(config)).await
    }

    /// A second store on the same cache root, as another process would open.
    pub async fn reopen(&self, adjust: impl FnOnce(&mut StoreConfig)) -> Arc<CalibrationStore> {
        let mut config = self.store.config().clone();
        adjust(&mut config);
        Arc::new(
            CalibrationStore::open(config)
                .await
                .expect("Failed to reopen calibration store"),
        )
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn local(&self) -> &Arc<dyn MetadataIndex> {
        self.store.local_index()
    }
}

#[allow(dead_code)]
pub fn obs(value: &str) -> ObsTime {
    ObsTime::parse(value).expect("valid observation time")
}

#[allow(dead_code)]
pub fn dark(filename: &str) -> NewCalibration {
    NewCalibration::new(filename, "dark", obs("2024-09-24T12:00:00.000"))
}

#[allow(dead_code)]
pub fn bytes(data: &str) -> Bytes {
    Bytes::copy_from_slice(data.as_bytes())
}
