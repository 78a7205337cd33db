//! PostgreSQL-backed calibration index, used as the shared remote index.

use crate::error::{
    FILENAME_CONSTRAINT, ID_CONSTRAINT, MetadataError, MetadataResult, VERSION_CONSTRAINT,
    insert_error, versioned_error,
};
use crate::models::{CALIBRATION_COLUMNS, CalibrationRow, rows_to_records};
use crate::query::CalibrationQuery;
use crate::store::{INSERT_SQL, ImportKind, MAX_VERSION_SQL, MetadataIndex, version_after};
use async_trait::async_trait;
use calstore_core::config::PgSslMode;
use calstore_core::{
    CalibrationRecord, IdStrategy, NewCalibration, Origin, Version, VersionFamily, now_utc,
    parse_last_updated,
};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

fn postgres_schema() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS calibrations (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL,
                instrument_name TEXT NOT NULL,
                filename TEXT NOT NULL,
                cal_type TEXT NOT NULL,
                datetime_obs TEXT NOT NULL,
                origin TEXT NOT NULL,
                version TEXT NOT NULL,
                version_family TEXT NOT NULL,
                attributes TEXT NOT NULL DEFAULT '{{}}',
                last_updated TEXT NOT NULL,
                imported BOOLEAN NOT NULL DEFAULT FALSE,
                CONSTRAINT {ID_CONSTRAINT} UNIQUE (id),
                CONSTRAINT {FILENAME_CONSTRAINT} UNIQUE (instrument_name, filename),
                CONSTRAINT {VERSION_CONSTRAINT}
                    UNIQUE (instrument_name, version_family, origin, version)
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_calibrations_cal_type_obs \
         ON calibrations(cal_type, datetime_obs)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_calibrations_last_updated \
         ON calibrations(last_updated)"
            .to_string(),
    ]
}

/// PostgreSQL-backed calibration index.
pub struct PostgresIndex {
    pool: Pool<Postgres>,
    family: VersionFamily,
}

impl PostgresIndex {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        family: VersionFamily,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, family, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual connection parameters, so the password can
    /// come from its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        family: VersionFamily,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL calibration index"
        );

        Self::connect(opts, family, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        family: VersionFamily,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let index = Self { pool, family };
        index.migrate().await?;
        Ok(index)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn ensure_open(&self) -> MetadataResult<()> {
        if self.pool.is_closed() {
            Err(MetadataError::Unavailable("index has been closed".into()))
        } else {
            Ok(())
        }
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
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    row: CalibrationRow,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
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
impl MetadataIndex for PostgresIndex {
    fn version_family(&self) -> &VersionFamily {
        &self.family
    }

    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL prepares one statement at a time.
        for statement in postgres_schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
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

    #[instrument(skip(self, record), fields(id = %record.id))]
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
        let namespace = family.namespace(instrument_name, origin);
        let map_err = |e: sqlx::Error| versioned_error(e, "<unassigned>", &draft.filename);

        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // Serialize writers of this namespace until commit; readers are unaffected.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&namespace)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

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
        let mut qb: QueryBuilder<'_, Postgres> =
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
        self.ensure_open()?;
        let sql = format!("SELECT {CALIBRATION_COLUMNS} FROM calibrations WHERE id = $1");
        sqlx::query_as::<_, CalibrationRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(CalibrationRecord::try_from)
            .transpose()
    }

    async fn get_by_filename(
        &self,
        instrument_name: &str,
        filename: &str,
    ) -> MetadataResult<Option<CalibrationRecord>> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {CALIBRATION_COLUMNS} FROM calibrations \
             WHERE instrument_name = $1 AND filename = $2"
        );
        sqlx::query_as::<_, CalibrationRow>(&sql)
            .bind(instrument_name)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?
            .map(CalibrationRecord::try_from)
            .transpose()
    }

    async fn get_last_updated(&self) -> MetadataResult<Option<OffsetDateTime>> {
        self.max_timestamp("SELECT MAX(last_updated) FROM calibrations")
            .await
    }

    async fn get_last_imported(&self) -> MetadataResult<Option<OffsetDateTime>> {
        self.max_timestamp("SELECT MAX(last_updated) FROM calibrations WHERE imported")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_every_unique_constraint() {
        let schema = postgres_schema();
        assert_eq!(schema.len(), 3);
        for name in [ID_CONSTRAINT, FILENAME_CONSTRAINT, VERSION_CONSTRAINT] {
            assert!(schema[0].contains(&format!("CONSTRAINT {name}")), "{name}");
        }
        assert!(schema[0].contains("DEFAULT '{}'"));
    }
}
