//! Database models mapping to the calibrations table.

use crate::error::{MetadataError, MetadataResult};
use calstore_core::{
    Attributes, CalibrationRecord, FamilyKey, ObsTime, Origin, Version, format_last_updated,
    parse_last_updated,
};
use sqlx::FromRow;
use uuid::Uuid;

/// Column list shared by every SELECT over the calibrations table.
pub(crate) const CALIBRATION_COLUMNS: &str = "id, instrument_name, filename, cal_type, \
     datetime_obs, origin, version, version_family, attributes, last_updated, imported";

/// Calibration row as stored.
///
/// Timestamps and versions are kept as canonical text so that lexical
/// comparison matches chronological and numeric order on every backend.
#[derive(Debug, Clone, FromRow)]
pub struct CalibrationRow {
    pub id: String,
    pub instrument_name: String,
    pub filename: String,
    pub cal_type: String,
    pub datetime_obs: String,
    pub origin: String,
    pub version: String,
    pub version_family: String,
    /// JSON object of instrument-specific fields.
    pub attributes: String,
    pub last_updated: String,
    /// Whether the row was pulled from a remote index by sync.
    pub imported: bool,
}

impl CalibrationRow {
    /// Build a row for `record` in the given version family.
    pub fn from_record(
        record: &CalibrationRecord,
        family: &FamilyKey,
        imported: bool,
    ) -> MetadataResult<Self> {
        Ok(Self {
            id: record.id.to_string(),
            instrument_name: record.instrument_name.clone(),
            filename: record.filename.clone(),
            cal_type: record.cal_type.clone(),
            datetime_obs: record.datetime_obs.to_string(),
            origin: record.origin.to_string(),
            version: record.version.to_string(),
            version_family: family.as_str().to_string(),
            attributes: serde_json::to_string(&record.attributes)?,
            last_updated: format_last_updated(record.last_updated),
            imported,
        })
    }
}

impl TryFrom<CalibrationRow> for CalibrationRecord {
    type Error = MetadataError;

    fn try_from(row: CalibrationRow) -> MetadataResult<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| MetadataError::Serialization(format!("bad id {:?}: {e}", row.id)))?;
        let datetime_obs = ObsTime::parse(&row.datetime_obs)
            .map_err(|e| MetadataError::Serialization(format!("row {id}: {e}")))?;
        let origin: Origin = row
            .origin
            .parse()
            .map_err(|e| MetadataError::Serialization(format!("row {id}: {e}")))?;
        let version: Version = row
            .version
            .parse()
            .map_err(|e| MetadataError::Serialization(format!("row {id}: {e}")))?;
        let attributes: Attributes = serde_json::from_str(&row.attributes)?;
        let last_updated = parse_last_updated(&row.last_updated)
            .map_err(|e| MetadataError::Serialization(format!("row {id}: {e}")))?;

        Ok(CalibrationRecord {
            id,
            instrument_name: row.instrument_name,
            filename: row.filename,
            cal_type: row.cal_type,
            datetime_obs,
            origin,
            version,
            attributes,
            last_updated,
        })
    }
}

/// Convert fetched rows, preserving order.
pub(crate) fn rows_to_records(rows: Vec<CalibrationRow>) -> MetadataResult<Vec<CalibrationRecord>> {
    rows.into_iter().map(CalibrationRecord::try_from).collect()
}
