//! Metadata index trait and the embedded SQLite implementation.

use crate::error::{MetadataError, MetadataResult, insert_error, versioned_error};
use crate::models::{CALIBRATION_COLUMNS, CalibrationRow, rows_to_records};
use crate::query::CalibrationQuery;
use async_trait::async_trait;
use calstore_core::{
    CalibrationRecord, FamilyKey, IdStrategy, NewCalibration, Origin, Version, VersionFamily,
    now_utc, parse_last_updated,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Shared contract of the local and remote calibration indexes.
///
/// An index owns the version-family policy it was opened with and derives
/// each record's family key itself, so every caller agrees on namespaces.
/// How a record copied from another index arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportKind {
    /// Pulled by a sync pass; advances the sync watermark.
    Synced,
    /// Pulled on demand by a single lookup.
    Fetched,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Version-family policy used to key records.
    fn version_family(&self) -> &VersionFamily;

    /// Create the schema if it does not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Insert a fully formed record, stamping `last_updated` with now.
    ///
    /// Fails with `DuplicateId` when the id exists and `Constraint` when the
    /// filename is already indexed. A version collision within the record's
    /// family surfaces as `VersionConflict`.
    async fn insert(&self, record: &CalibrationRecord) -> MetadataResult<CalibrationRecord>;

    /// Insert a record pulled from another index, keeping its `last_updated`.
    /// Only [`ImportKind::Synced`] rows count toward
    /// [`get_last_imported`](Self::get_last_imported). Returns `false` when
    /// the id already exists.
    async fn import(&self, record: &CalibrationRecord, kind: ImportKind) -> MetadataResult<bool>;

    /// Version the next sibling of `draft` would receive, without reserving it.
    async fn next_version(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
    ) -> MetadataResult<Version>;

    /// Assign the next free version to `draft` and insert it, as one atomic
    /// unit of work against the index.
    ///
    /// Losing a race to a concurrent sibling surfaces as `VersionConflict`;
    /// callers recompute by calling again.
    async fn insert_versioned(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
        ids: IdStrategy,
    ) -> MetadataResult<CalibrationRecord>;

    async fn query(&self, query: &CalibrationQuery) -> MetadataResult<Vec<CalibrationRecord>>;

    async fn get_by_id(&self, id: Uuid) -> MetadataResult<Option<CalibrationRecord>>;

    async fn get_by_filename(
        &self,
        instrument_name: &str,
        filename: &str,
    ) -> MetadataResult<Option<CalibrationRecord>>;

    /// Most recent `last_updated` across all records.
    async fn get_last_updated(&self) -> MetadataResult<Option<OffsetDateTime>>;

    /// Most recent `last_updated` across records imported by sync.
    async fn get_last_imported(&self) -> MetadataResult<Option<OffsetDateTime>>;

    /// Number of indexed records.
    async fn count(&self) -> MetadataResult<u64>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Release all connections. Further calls fail with `Unavailable`.
    async fn close(&self);
}

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS calibrations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    instrument_name TEXT NOT NULL,
    filename TEXT NOT NULL,
    cal_type TEXT NOT NULL,
    datetime_obs TEXT NOT NULL,
    origin TEXT NOT NULL,
    version TEXT NOT NULL,
    version_family TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    last_updated TEXT NOT NULL,
    imported INTEGER NOT NULL DEFAULT 0,
    UNIQUE (instrument_name, filename),
    UNIQUE (instrument_name, version_family, origin, version)
);
CREATE INDEX IF NOT EXISTS idx_calibrations_cal_type_obs ON calibrations(cal_type, datetime_obs);
CREATE INDEX IF NOT EXISTS idx_calibrations_last_updated ON calibrations(last_updated);
"#;

pub(crate) const MAX_VERSION_SQL: &str = "SELECT MAX(version) FROM calibrations \
     WHERE instrument_name = $1 AND version_family = $2 AND origin = $3";

pub(crate) const INSERT_SQL: &str = "INSERT INTO calibrations (id, instrument_name, filename, \
     cal_type, datetime_obs, origin, version, version_family, attributes, last_updated, imported) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

/// Next version after the stored maximum, or `VersionExhausted`.
pub(crate) fn version_after(
    current: Option<String>,
    family: &FamilyKey,
    instrument_name: &str,
    origin: &Origin,
) -> MetadataResult<Version> {
    let current = current.map(|v| v.parse::<Version>()).transpose()?;
    Version::after(current).ok_or_else(|| {
        MetadataError::VersionExhausted(format!("{instrument_name}/{family}/{origin}"))
    })
}

/// SQLite-backed calibration index.
pub struct SqliteIndex {
    pool: Pool<Sqlite>,
    family: VersionFamily,
}

impl SqliteIndex {
    /// Open (creating if necessary) an index file.
    pub async fn new(
        path: impl AsRef<Path>,
        family: VersionFamily,
        busy_timeout: Duration,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            return Self::in_memory(family).await;
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Other processes sharing the file hold the write lock briefly.
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers within this process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let index = Self { pool, family };
        index.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite calibration index");
        Ok(index)
    }

    /// Private in-memory index, dropped with the last handle.
    pub async fn in_memory(family: VersionFamily) -> MetadataResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // The database lives only as long as its single connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let index = Self { pool, family };
        index.migrate().await?;
        Ok(index)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn ensure_open(&self) -> MetadataResult<()> {
        if self.pool.is_closed() {
            Err(MetadataError::Unavailable("index has been closed".into()))
        } else {
            Ok(())
        }
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        first: &str,
        second: Option<&str>,
    ) -> MetadataResult<Option<CalibrationRecord>> {
        self.ensure_open()?;
        let mut query = sqlx::query_as::<_, CalibrationRow>(sql).bind(first.to_string());
        if let Some(second) = second {
            query = query.bind(second.to_string());
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(CalibrationRecord::try_from)
            .transpose()
    }

    async fn max_timestamp(&self, sql: &str) -> MetadataResult<Option<OffsetDateTime>> {
        self.ensure_open()?;
        let value: Option<String> = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        value
            .map(|v| parse_last_updated(&v).map_err(MetadataError::from))
            .transpose()
    }
}

fn bind_row<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    row: CalibrationRow,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(row.id)
        .bind(row.instrument_name)
        .bind(row.filename)
        .bind(row.cal_type)
        .bind(row.datetime_obs)
        .bind(row.origin)
        .bind(row.version)
        .bind(row.version_family)
        .bind(row.attributes)
        .bind(row.last_updated)
        .bind(row.imported)
}

#[async_trait]
impl MetadataIndex for SqliteIndex {
    fn version_family(&self) -> &VersionFamily {
        &self.family
    }

    async fn migrate(&self) -> MetadataResult<()> {
        for statement in SQLITE_SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(id = %record.id, filename = %record.filename))]
    async fn insert(&self, record: &CalibrationRecord) -> MetadataResult<CalibrationRecord> {
        self.ensure_open()?;
        let family = self.family.key(record)?;
        let mut stamped = record.clone();
        stamped.last_updated = now_utc();
        let row = CalibrationRow::from_record(&stamped, &family, false)?;

        bind_row(sqlx::query(INSERT_SQL), row)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, &record.id.to_string(), &record.filename))?;
        Ok(stamped)
    }

    #[instrument(skip(self, record), fields(id = %record.id, ?kind))]
    async fn import(&self, record: &CalibrationRecord, kind: ImportKind) -> MetadataResult<bool> {
        self.ensure_open()?;
        let family = self.family.key(record)?;
        let row = CalibrationRow::from_record(record, &family, kind == ImportKind::Synced)?;
        let sql = format!("{INSERT_SQL} ON CONFLICT (id) DO NOTHING");

        let result = bind_row(sqlx::query(&sql), row)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, &record.id.to_string(), &record.filename))?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_version(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
    ) -> MetadataResult<Version> {
        self.ensure_open()?;
        let family = self.family.key(draft)?;
        let current: Option<String> = sqlx::query_scalar(MAX_VERSION_SQL)
            .bind(instrument_name)
            .bind(family.as_str())
            .bind(origin.as_str())
            .fetch_one(&self.pool)
            .await?;
        version_after(current, &family, instrument_name, origin)
    }

    #[instrument(skip(self, draft), fields(filename = %draft.filename, origin = %origin))]
    async fn insert_versioned(
        &self,
        draft: &NewCalibration,
        instrument_name: &str,
        origin: &Origin,
        ids: IdStrategy,
    ) -> MetadataResult<CalibrationRecord> {
        self.ensure_open()?;
        draft.validate()?;
        let family = self.family.key(draft)?;
        let map_err = |e: sqlx::Error| versioned_error(e, "<unassigned>", &draft.filename);

        // Reading the maximum and inserting share one transaction. A writer in
        // another process that commits in between fails this transaction with
        // a busy error or trips the version constraint.
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let current: Option<String> = sqlx::query_scalar(MAX_VERSION_SQL)
            .bind(instrument_name)
            .bind(family.as_str())
            .bind(origin.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        let version = version_after(current, &family, instrument_name, origin)?;

        let id = ids.generate(instrument_name, &draft.filename, origin, version);
        let record = CalibrationRecord::from_draft(
            id,
            instrument_name,
            draft,
            origin.clone(),
            version,
            now_utc(),
        );
        let row = CalibrationRow::from_record(&record, &family, false)?;
        bind_row(sqlx::query(INSERT_SQL), row)
            .execute(&mut *tx)
            .await
            .map_err(|e| versioned_error(e, &id.to_string(), &draft.filename))?;
        tx.commit()
            .await
            .map_err(|e| versioned_error(e, &id.to_string(), &draft.filename))?;

        tracing::debug!(%id, %version, "assigned calibration version");
        Ok(record)
    }

    #[instrument(skip(self, query))]
    async fn query(&self, query: &CalibrationQuery) -> MetadataResult<Vec<CalibrationRecord>> {
        self.ensure_open()?;
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {CALIBRATION_COLUMNS} FROM calibrations"));
        let mut separator = " WHERE ";
        for filter in query.sql_filters() {
            qb.push(separator)
                .push(filter.column)
                .push(filter.op)
                .push_bind(filter.value);
            separator = " AND ";
        }
        qb.push(" ORDER BY ").push(query.order_clause());
        if let Some(limit) = query.sql_limit() {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build_query_as::<CalibrationRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(query.finish(rows_to_records(rows)?))
    }

    async fn get_by_id(&self, id: Uuid) -> MetadataResult<Option<CalibrationRecord>> {
        let sql = format!("SELECT {CALIBRATION_COLUMNS} FROM calibrations WHERE id = $1");
        self.fetch_optional(&sql, &id.to_string(), None).await
    }

    async fn get_by_filename(
        &self,
        instrument_name: &str,
        filename: &str,
    ) -> MetadataResult<Option<CalibrationRecord>> {
        let sql = format!(
            "SELECT {CALIBRATION_COLUMNS} FROM calibrations \
             WHERE instrument_name = $1 AND filename = $2"
        );
        self.fetch_optional(&sql, instrument_name, Some(filename))
            .await
    }

    async fn get_last_updated(&self) -> MetadataResult<Option<OffsetDateTime>> {
        self.max_timestamp("SELECT MAX(last_updated) FROM calibrations")
            .await
    }

    async fn get_last_imported(&self) -> MetadataResult<Option<OffsetDateTime>> {
        self.max_timestamp("SELECT MAX(last_updated) FROM calibrations WHERE imported = 1")
            .await
    }

    async fn count(&self) -> MetadataResult<u64> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM calibrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.ensure_open()?;
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
