//! Observation and bookkeeping timestamps.
//!
//! Observation times are kept at millisecond precision in UTC and rendered as
//! `YYYY-MM-DDTHH:MM:SS.sss`, the canonical form used in version-family keys
//! and index range predicates. Bookkeeping timestamps (`last_updated`) are
//! kept at microsecond precision and rendered with a trailing `Z` so that
//! lexical order matches chronological order in every index backend.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Observation timestamp, normalized to UTC with millisecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObsTime(PrimitiveDateTime);

impl ObsTime {
    /// Parse and normalize an observation timestamp.
    ///
    /// Accepts ISO-8601 with or without an offset (offsets are converted to
    /// UTC), a bare date, or an HTTP-date such as
    /// `Thu, 12 Feb 2026 00:00:00 GMT`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidTimestamp("empty timestamp".to_string()));
        }

        if let Ok(dt) = OffsetDateTime::parse(value, &Rfc3339) {
            let utc = dt.to_offset(UtcOffset::UTC);
            return Self::from_datetime(PrimitiveDateTime::new(utc.date(), utc.time()));
        }

        let local = value.replacen(' ', "T", 1);
        let naive = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        );
        if let Ok(dt) = PrimitiveDateTime::parse(&local, naive) {
            return Self::from_datetime(dt);
        }

        let date_only = format_description!("[year]-[month]-[day]");
        if let Ok(date) = Date::parse(value, date_only) {
            return Self::from_datetime(date.midnight());
        }

        let http_date = format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        );
        if let Ok(dt) = PrimitiveDateTime::parse(value, http_date) {
            return Self::from_datetime(dt);
        }

        Err(Error::InvalidTimestamp(value.to_string()))
    }

    /// Build from a naive UTC datetime, truncating to milliseconds.
    pub fn from_datetime(dt: PrimitiveDateTime) -> Result<Self> {
        let nanos = u32::from(dt.millisecond()) * 1_000_000;
        dt.replace_nanosecond(nanos)
            .map(Self)
            .map_err(|e| Error::InvalidTimestamp(e.to_string()))
    }

    /// The underlying naive UTC datetime.
    pub fn as_datetime(&self) -> PrimitiveDateTime {
        self.0
    }

    /// Absolute distance between two observation times.
    pub fn abs_diff(&self, other: &ObsTime) -> Duration {
        (self.0 - other.0).abs()
    }

    /// Shift by a signed duration, saturating at the calendar bounds.
    pub fn saturating_add(&self, delta: Duration) -> ObsTime {
        ObsTime(self.0.saturating_add(delta))
    }
}

impl fmt::Display for ObsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let canonical =
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");
        let rendered = self.0.format(canonical).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl FromStr for ObsTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ObsTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObsTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ObsTime::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Normalize any accepted timestamp string to `YYYY-MM-DDTHH:MM:SS.sss` (UTC).
pub fn normalize_timestamp(value: &str) -> Result<String> {
    ObsTime::parse(value).map(|t| t.to_string())
}

/// Current UTC time truncated to microseconds.
pub fn now_utc() -> OffsetDateTime {
    truncate_micros(OffsetDateTime::now_utc())
}

/// Truncate a timestamp to microsecond precision.
pub fn truncate_micros(ts: OffsetDateTime) -> OffsetDateTime {
    let micros = ts.microsecond();
    // Microsecond value always fits in a nanosecond field.
    ts.replace_nanosecond(micros * 1_000).unwrap_or(ts)
}

/// Render a bookkeeping timestamp as `YYYY-MM-DDTHH:MM:SS.ffffffZ` (UTC).
pub fn format_last_updated(ts: OffsetDateTime) -> String {
    let utc = ts.to_offset(UtcOffset::UTC);
    let fmt = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    utc.format(fmt)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

/// Parse a bookkeeping timestamp produced by [`format_last_updated`].
///
/// Any RFC 3339 timestamp is accepted as well.
pub fn parse_last_updated(value: &str) -> Result<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(truncate_micros(ts.to_offset(UtcOffset::UTC)));
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    PrimitiveDateTime::parse(value.trim_end_matches('Z'), naive)
        .map(|dt| truncate_micros(dt.assume_utc()))
        .map_err(|e| Error::InvalidTimestamp(format!("{value}: {e}")))
}
