//! Calibration query predicates.

use calstore_core::{Attributes, CalibrationRecord, ObsTime, Origin, format_last_updated};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Field a query result is ordered by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderBy {
    /// Insertion order.
    #[default]
    Inserted,
    DatetimeObs,
    LastUpdated,
    Version,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Predicate over calibration records.
///
/// Every populated field narrows the result. Time bounds are inclusive.
/// Attribute predicates compare instrument-specific fields for equality.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationQuery {
    pub instrument_name: Option<String>,
    pub id: Option<Uuid>,
    pub cal_type: Option<String>,
    pub filename: Option<String>,
    pub origin: Option<Origin>,
    pub date_time_start: Option<ObsTime>,
    pub date_time_end: Option<ObsTime>,
    pub last_updated_start: Option<OffsetDateTime>,
    pub last_updated_end: Option<OffsetDateTime>,
    pub attributes: Attributes,
    pub order_by: OrderBy,
    pub direction: SortDirection,
    pub limit: Option<usize>,
}

impl CalibrationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrument(mut self, instrument_name: impl Into<String>) -> Self {
        self.instrument_name = Some(instrument_name.into());
        self
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn cal_type(mut self, cal_type: impl Into<String>) -> Self {
        self.cal_type = Some(cal_type.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Restrict `datetime_obs` to `[start, end]`; either bound may be open.
    pub fn date_time_range(mut self, start: Option<ObsTime>, end: Option<ObsTime>) -> Self {
        self.date_time_start = start;
        self.date_time_end = end;
        self
    }

    /// Records updated at or after `start`.
    pub fn updated_since(mut self, start: OffsetDateTime) -> Self {
        self.last_updated_start = Some(start);
        self
    }

    pub fn updated_before(mut self, end: OffsetDateTime) -> Self {
        self.last_updated_end = Some(end);
        self
    }

    /// Require an instrument-specific field to equal `value`.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn order_by(mut self, order_by: OrderBy, direction: SortDirection) -> Self {
        self.order_by = order_by;
        self.direction = direction;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Column predicates evaluated by the database.
    pub(crate) fn sql_filters(&self) -> Vec<SqlFilter> {
        let mut filters = Vec::new();
        let mut push = |column: &'static str, op: &'static str, value: String| {
            filters.push(SqlFilter { column, op, value });
        };
        if let Some(instrument) = &self.instrument_name {
            push("instrument_name", " = ", instrument.clone());
        }
        if let Some(id) = self.id {
            push("id", " = ", id.to_string());
        }
        if let Some(cal_type) = &self.cal_type {
            push("cal_type", " = ", cal_type.clone());
        }
        if let Some(filename) = &self.filename {
            push("filename", " = ", filename.clone());
        }
        if let Some(origin) = &self.origin {
            push("origin", " = ", origin.to_string());
        }
        if let Some(start) = self.date_time_start {
            push("datetime_obs", " >= ", start.to_string());
        }
        if let Some(end) = self.date_time_end {
            push("datetime_obs", " <= ", end.to_string());
        }
        if let Some(start) = self.last_updated_start {
            push("last_updated", " >= ", format_last_updated(start));
        }
        if let Some(end) = self.last_updated_end {
            push("last_updated", " <= ", format_last_updated(end));
        }
        filters
    }

    /// ORDER BY clause; insertion sequence breaks ties.
    pub(crate) fn order_clause(&self) -> &'static str {
        match (self.order_by, self.direction) {
            (OrderBy::Inserted, SortDirection::Asc) => "seq ASC",
            (OrderBy::Inserted, SortDirection::Desc) => "seq DESC",
            (OrderBy::DatetimeObs, SortDirection::Asc) => "datetime_obs ASC, seq ASC",
            (OrderBy::DatetimeObs, SortDirection::Desc) => "datetime_obs DESC, seq DESC",
            (OrderBy::LastUpdated, SortDirection::Asc) => "last_updated ASC, seq ASC",
            (OrderBy::LastUpdated, SortDirection::Desc) => "last_updated DESC, seq DESC",
            (OrderBy::Version, SortDirection::Asc) => "version ASC, seq ASC",
            (OrderBy::Version, SortDirection::Desc) => "version DESC, seq DESC",
        }
    }

    /// LIMIT to push down to the database. Attribute predicates are applied
    /// after fetching, so the limit is applied in memory when any are set.
    pub(crate) fn sql_limit(&self) -> Option<i64> {
        if self.attributes.is_empty() {
            self.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        } else {
            None
        }
    }

    /// True when `record` satisfies the attribute predicates.
    pub fn matches_attributes(&self, record: &CalibrationRecord) -> bool {
        self.attributes
            .iter()
            .all(|(name, expected)| record.attribute(name) == Some(expected))
    }

    /// Apply in-memory predicates and the limit to database results.
    pub(crate) fn finish(&self, records: Vec<CalibrationRecord>) -> Vec<CalibrationRecord> {
        if self.attributes.is_empty() {
            return records;
        }
        let filtered = records.into_iter().filter(|r| self.matches_attributes(r));
        match self.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        }
    }
}

/// One `column op value` predicate.
#[derive(Debug)]
pub(crate) struct SqlFilter {
    pub column: &'static str,
    pub op: &'static str,
    pub value: String,
}
