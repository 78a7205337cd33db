//! Calibration metadata indexes.
//!
//! This crate provides the record store behind the calibration cache:
//! - The [`MetadataIndex`] contract shared by local and remote indexes
//! - An embedded SQLite index for the per-instrument local cache
//! - A PostgreSQL index for the shared remote service
//! - Version assignment inside a single index transaction

pub mod error;
pub mod models;
pub mod postgres;
pub mod query;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresIndex;
pub use query::{CalibrationQuery, OrderBy, SortDirection};
pub use store::{ImportKind, MetadataIndex, SqliteIndex};

use calstore_core::VersionFamily;
use calstore_core::config::MetadataConfig;
use std::sync::Arc;
use std::time::Duration;

/// Open a metadata index from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    family: VersionFamily,
) -> MetadataResult<Arc<dyn MetadataIndex>> {
    config.validate().map_err(MetadataError::Config)?;
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_ms,
        } => {
            let index =
                SqliteIndex::new(path, family, Duration::from_millis(*busy_timeout_ms)).await?;
            Ok(Arc::new(index) as Arc<dyn MetadataIndex>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let index = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresIndex::from_url(url, family, *max_connections, *statement_timeout_ms)
                    .await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresIndex::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    family,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(index) as Arc<dyn MetadataIndex>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("database").join("hispec_calibrations.db");
        let config = MetadataConfig::sqlite(&db_path);

        let index = from_config(&config, VersionFamily::default()).await.unwrap();
        index.health_check().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_from_config_rejects_incomplete_postgres() {
        let config = MetadataConfig::Postgres {
            url: None,
            host: None,
            port: Some(5432),
            username: None,
            password: None,
            database: Some("cal".into()),
            ssl_mode: None,
            max_connections: 2,
            statement_timeout_ms: None,
        };
        let result = from_config(&config, VersionFamily::default()).await;
        assert!(matches!(result, Err(MetadataError::Config(_))));
    }
}
