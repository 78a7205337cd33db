//! Configuration types shared across crates.
//!
//! A [`StoreConfig`] is resolved once when a store is opened and is never
//! re-read afterwards. [`StoreConfig::load`] layers built-in defaults, an
//! optional TOML file and `CALSTORE_`-prefixed environment variables
//! (nested keys use `__`, e.g. `CALSTORE_REMOTE__TIMEOUT_SECS=10`).

use crate::error::{Error, Result};
use crate::record::{IdStrategy, Origin};
use crate::version::{DEFAULT_FAMILY_FIELDS, VersionFamily};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for configuration environment variables.
pub const ENV_PREFIX: &str = "CALSTORE_";

/// Subdirectory of the cache root holding calibration artifacts.
pub const CALIBRATIONS_DIR: &str = "calibrations";

/// Subdirectory of the cache root holding local index files.
pub const DATABASE_DIR: &str = "database";

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata index backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file (`:memory:` for a private in-memory index).
    Sqlite {
        path: PathBuf,
        /// How long a writer waits for another process's lock, in milliseconds.
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer CALSTORE_REMOTE__INDEX__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl MetadataConfig {
    /// SQLite index at `path` with default settings.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// PostgreSQL index at `url` with default settings.
    pub fn postgres_url(url: impl Into<String>) -> Self {
        Self::Postgres {
            url: Some(url.into()),
            host: None,
            port: default_pg_port(),
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: default_max_connections(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }

    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } => {
                if path.as_os_str().is_empty() {
                    Err("sqlite config requires a non-empty 'path'".to_string())
                } else {
                    Ok(())
                }
            }
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Shared remote service configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Remote metadata index. `None` disables remote lookups and sync.
    #[serde(default)]
    pub index: Option<MetadataConfig>,
    /// Base URL of the artifact service. `None` disables downloads.
    #[serde(default)]
    pub artifact_base_url: Option<String>,
    /// Upper bound on any single remote call, in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_remote_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            index: None,
            artifact_base_url: None,
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    /// Bounded timeout applied to remote calls.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which metadata index the selection pipeline reads from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexTarget {
    #[default]
    Local,
    Remote,
}

/// Calibration store configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Top-level cache directory (artifacts and local index files).
    pub cache_root: PathBuf,
    /// Instrument whose calibrations this store manages.
    pub instrument_name: String,
    /// Local index filename under `<cache_root>/database/`.
    /// Defaults to `<instrument>_calibrations.db`.
    #[serde(default)]
    pub local_index_filename: Option<String>,
    /// Remote index and artifact service.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Serve cached artifacts when present instead of re-downloading.
    #[serde(default = "default_use_cached")]
    pub use_cached: bool,
    /// Fields whose values define a version family.
    #[serde(default = "default_version_family_fields")]
    pub version_family_fields: Vec<String>,
    /// Origin stamped on calibrations registered through this store.
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    #[serde(default)]
    pub selection_index: IndexTarget,
    /// Attempts at assigning a version before a race is reported.
    #[serde(default = "default_max_version_retries")]
    pub max_version_retries: u32,
}

fn default_use_cached() -> bool {
    true
}

fn default_version_family_fields() -> Vec<String> {
    DEFAULT_FAMILY_FIELDS.iter().map(|f| f.to_string()).collect()
}

fn default_max_version_retries() -> u32 {
    8
}

impl StoreConfig {
    /// Configuration with defaults for everything but the cache root and instrument.
    pub fn new(cache_root: impl Into<PathBuf>, instrument_name: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            instrument_name: instrument_name.into(),
            local_index_filename: None,
            remote: RemoteConfig::default(),
            use_cached: default_use_cached(),
            version_family_fields: default_version_family_fields(),
            origin: Origin::default(),
            id_strategy: IdStrategy::default(),
            selection_index: IndexTarget::default(),
            max_version_retries: default_max_version_retries(),
        }
    }

    /// Load configuration from an optional TOML file overlaid with
    /// `CALSTORE_` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: StoreConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.instrument_name.trim().is_empty() {
            return Err(Error::Config("instrument_name must not be empty".into()));
        }
        if self
            .instrument_name
            .contains(|c: char| c == '/' || c == '\\' || c == '.')
        {
            return Err(Error::Config(format!(
                "instrument_name {:?} must not contain path separators or dots",
                self.instrument_name
            )));
        }
        if self.cache_root.as_os_str().is_empty() {
            return Err(Error::Config("cache_root must not be empty".into()));
        }
        self.version_family()?;
        if self.max_version_retries == 0 {
            return Err(Error::Config("max_version_retries must be at least 1".into()));
        }
        if self.remote.timeout_secs == 0 {
            return Err(Error::Config("remote.timeout_secs must be at least 1".into()));
        }
        if let Some(index) = &self.remote.index {
            index.validate().map_err(Error::Config)?;
        }
        if self.selection_index == IndexTarget::Remote && self.remote.index.is_none() {
            return Err(Error::Config(
                "selection_index = \"remote\" requires remote.index".into(),
            ));
        }
        Ok(())
    }

    /// The configured version-family policy.
    pub fn version_family(&self) -> Result<VersionFamily> {
        VersionFamily::new(self.version_family_fields.iter().cloned())
    }

    /// `<cache_root>/calibrations`.
    pub fn calibrations_dir(&self) -> PathBuf {
        self.cache_root.join(CALIBRATIONS_DIR)
    }

    /// `<cache_root>/database`.
    pub fn database_dir(&self) -> PathBuf {
        self.cache_root.join(DATABASE_DIR)
    }

    /// Full path of the local index file.
    pub fn local_index_path(&self) -> PathBuf {
        match self.local_index_filename.as_deref() {
            Some(":memory:") => PathBuf::from(":memory:"),
            Some(name) => self.database_dir().join(name),
            None => self.database_dir().join(format!(
                "{}_calibrations.db",
                self.instrument_name.to_lowercase()
            )),
        }
    }

    /// Local index configuration derived from the cache layout.
    pub fn local_index(&self) -> MetadataConfig {
        MetadataConfig::sqlite(self.local_index_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/cache", "hispec");
        assert!(config.use_cached);
        assert_eq!(config.origin, Origin::Local);
        assert_eq!(config.version_family_fields, vec!["cal_type", "datetime_obs"]);
        assert_eq!(config.remote.timeout(), Duration::from_secs(30));
        assert_eq!(
            config.local_index_path(),
            PathBuf::from("/tmp/cache/database/hispec_calibrations.db")
        );
        assert_eq!(
            config.calibrations_dir(),
            PathBuf::from("/tmp/cache/calibrations")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_memory_index_path() {
        let mut config = StoreConfig::new("/tmp/cache", "hispec");
        config.local_index_filename = Some(":memory:".into());
        assert_eq!(config.local_index_path(), PathBuf::from(":memory:"));
    }

    #[test]
    fn test_validate_rejects_origin_family_field() {
        let mut config = StoreConfig::new("/tmp/cache", "hispec");
        config.version_family_fields = vec!["cal_type".into(), "origin".into()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_remote_selection_without_index() {
        let mut config = StoreConfig::new("/tmp/cache", "hispec");
        config.selection_index = IndexTarget::Remote;
        assert!(config.validate().is_err());
        config.remote.index = Some(MetadataConfig::postgres_url("postgres://localhost/cal"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_instrument() {
        assert!(StoreConfig::new("/tmp/cache", "").validate().is_err());
        assert!(StoreConfig::new("/tmp/cache", "../etc").validate().is_err());
    }

    #[test]
    fn test_postgres_requires_database() {
        let config = MetadataConfig::Postgres {
            url: None,
            host: Some("db".into()),
            port: Some(5432),
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 4,
            statement_timeout_ms: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metadata_config_tagged_json() {
        let json = r#"{"type":"sqlite","path":"/tmp/remote.db"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, MetadataConfig::sqlite("/tmp/remote.db"));
    }

    #[test]
    fn test_load_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("CALSTORE_CACHE_ROOT", "/data/cal");
            jail.set_env("CALSTORE_INSTRUMENT_NAME", "parvi");
            jail.set_env("CALSTORE_USE_CACHED", "false");
            jail.set_env("CALSTORE_ORIGIN", "KECK");
            jail.set_env("CALSTORE_REMOTE__TIMEOUT_SECS", "5");
            let config = StoreConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.cache_root, PathBuf::from("/data/cal"));
            assert!(!config.use_cached);
            assert_eq!(config.origin, Origin::Keck);
            assert_eq!(config.remote.timeout_secs, 5);
            assert_eq!(
                config.local_index_path(),
                PathBuf::from("/data/cal/database/parvi_calibrations.db")
            );
            Ok(())
        });
    }

    #[test]
    fn test_load_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "calstore.toml",
                r#"
                cache_root = "/from/file"
                instrument_name = "hispec"
                version_family_fields = ["cal_type", "datetime_obs", "spectrograph"]

                [remote]
                artifact_base_url = "https://archive.example.org/cal/"

                [remote.index]
                type = "postgres"
                url = "postgres://archive/cal"
                "#,
            )?;
            jail.set_env("CALSTORE_CACHE_ROOT", "/from/env");
            let config =
                StoreConfig::load(Some(Path::new("calstore.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.cache_root, PathBuf::from("/from/env"));
            assert_eq!(config.version_family_fields.len(), 3);
            assert_eq!(
                config.remote.artifact_base_url.as_deref(),
                Some("https://archive.example.org/cal/")
            );
            assert!(matches!(
                config.remote.index,
                Some(MetadataConfig::Postgres { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn test_load_requires_cache_root() {
        Jail::expect_with(|jail| {
            jail.set_env("CALSTORE_INSTRUMENT_NAME", "hispec");
            assert!(StoreConfig::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(matches!(
            StoreConfig::load(Some(Path::new("/nonexistent/calstore.toml"))),
            Err(Error::Config(_))
        ));
    }
}
