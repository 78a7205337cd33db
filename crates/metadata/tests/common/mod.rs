//! Metadata index test utilities.

use calstore_core::{NewCalibration, ObsTime, VersionFamily};
use calstore_metadata::{MetadataError, MetadataIndex, MetadataResult, PostgresIndex, SqliteIndex};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// File-backed SQLite index that cleans up on drop.
#[allow(dead_code)]
pub struct TestIndex {
    pub index: Arc<SqliteIndex>,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestIndex {
    pub async fn new() -> MetadataResult<Self> {
        Self::with_family(VersionFamily::default()).await
    }

    pub async fn with_family(family: VersionFamily) -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("hispec_calibrations.db");
        let index = SqliteIndex::new(&db_path, family, Duration::from_secs(5)).await?;
        Ok(Self {
            index: Arc::new(index),
            temp_dir,
        })
    }

    /// A second, independent handle on the same database file.
    pub async fn reopen(&self) -> MetadataResult<Arc<SqliteIndex>> {
        let db_path = self.temp_dir.path().join("hispec_calibrations.db");
        let index = SqliteIndex::new(&db_path, VersionFamily::default(), Duration::from_secs(5))
            .await?;
        Ok(Arc::new(index))
    }

    pub fn index(&self) -> Arc<dyn MetadataIndex> {
        self.index.clone()
    }
}

/// PostgreSQL index backed by a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestIndex {
    pub index: Arc<PostgresIndex>,
    url: String,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestIndex {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let index = PostgresIndex::from_url(&url, VersionFamily::default(), 8, None).await?;

        Ok(Self {
            index: Arc::new(index),
            url,
            _container: container,
        })
    }

    /// A second pool on the same database, standing in for another process.
    pub async fn reopen(&self) -> MetadataResult<Arc<PostgresIndex>> {
        let index = PostgresIndex::from_url(&self.url, VersionFamily::default(), 8, None).await?;
        Ok(Arc::new(index))
    }

    pub fn index(&self) -> Arc<dyn MetadataIndex> {
        self.index.clone()
    }
}

/// Try to create a PostgreSQL test index, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip; setup regressions still panic.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestIndex> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestIndex::new().await {
        Ok(index) => Some(index),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Run a test against both SQLite and PostgreSQL backends.
#[allow(dead_code)]
pub async fn run_index_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataIndex>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestIndex::new()
        .await
        .expect("Failed to create SQLite test index");
    test_fn.clone()(sqlite.index()).await;

    if let Some(postgres) = postgres_or_skip().await {
        test_fn(postgres.index()).await;
    }
}

/// A draft in the default `dark` family used across tests.
#[allow(dead_code)]
pub fn dark(filename: &str, obs: &str) -> NewCalibration {
    NewCalibration::new(
        filename,
        "dark",
        ObsTime::parse(obs).expect("valid test timestamp"),
    )
}
