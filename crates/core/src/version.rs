//! Calibration versions and version-family keys.
//!
//! Two calibrations are siblings when they agree on every configured family
//! field and share an origin. Siblings must carry distinct versions drawn
//! from `001..=999`.

use crate::error::{Error, Result};
use crate::record::{FieldSource, Origin};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Highest version number a family may hold.
pub const MAX_VERSION: u16 = 999;

/// Default version-family fields.
pub const DEFAULT_FAMILY_FIELDS: [&str; 2] = ["cal_type", "datetime_obs"];

/// A calibration version in `001..=999`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u16);

impl Version {
    /// The first version of every family.
    pub const FIRST: Version = Version(1);

    /// Create a version, rejecting values outside `1..=999`.
    pub fn new(value: u16) -> Result<Self> {
        if (1..=MAX_VERSION).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidVersion(format!(
                "{value} is outside 1..={MAX_VERSION}"
            )))
        }
    }

    /// Numeric value.
    pub fn get(&self) -> u16 {
        self.0
    }

    /// The following version, or `None` when the family is exhausted.
    pub fn next(&self) -> Option<Version> {
        (self.0 < MAX_VERSION).then(|| Version(self.0 + 1))
    }

    /// Version that follows `current`, starting at `001` for an empty family.
    pub fn after(current: Option<Version>) -> Option<Version> {
        match current {
            None => Some(Version::FIRST),
            Some(v) => v.next(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidVersion(format!(
                "expected three zero-padded digits, got {s:?}"
            )));
        }
        let value: u16 = s
            .parse()
            .map_err(|e| Error::InvalidVersion(format!("{s}: {e}")))?;
        Version::new(value)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Policy naming the metadata fields that make up a version family.
///
/// `origin` is never a configurable field: it always partitions the
/// namespace on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionFamily {
    fields: Vec<String>,
}

impl VersionFamily {
    /// Create a policy from a list of field names.
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for field in fields {
            let field = field.into();
            let trimmed = field.trim();
            if trimmed.is_empty() {
                return Err(Error::Config("version family field names must not be empty".into()));
            }
            if trimmed == "origin" {
                return Err(Error::Config(
                    "origin is always part of the version namespace and cannot be listed".into(),
                ));
            }
            if seen.iter().any(|f: &String| f == trimmed) {
                return Err(Error::Config(format!(
                    "duplicate version family field: {trimmed}"
                )));
            }
            seen.push(trimmed.to_string());
        }
        if seen.is_empty() {
            return Err(Error::Config(
                "version family requires at least one field".into(),
            ));
        }
        Ok(Self { fields: seen })
    }

    /// Configured field names, in key order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Compute the family key for a record or draft.
    ///
    /// Fails with [`Error::InvalidMetadata`] when a family field is missing
    /// or empty.
    pub fn key(&self, source: &impl FieldSource) -> Result<FamilyKey> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match source.field(field) {
                Some(value) if !value.is_empty() => parts.push((field.as_str(), value)),
                _ => {
                    return Err(Error::InvalidMetadata(format!(
                        "missing version family field: {field}"
                    )));
                }
            }
        }
        let encoded = serde_json::to_string(&parts)
            .map_err(|e| Error::InvalidMetadata(format!("unencodable family key: {e}")))?;
        Ok(FamilyKey(encoded))
    }
}

impl Default for VersionFamily {
    fn default() -> Self {
        Self {
            fields: DEFAULT_FAMILY_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Canonical encoding of the configured family field values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FamilyKey(String);

impl FamilyKey {
    /// Wrap an already encoded key (as stored in an index).
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key identifying the full version namespace: instrument, family and origin.
    pub fn namespace(&self, instrument_name: &str, origin: &Origin) -> String {
        format!("{instrument_name}\u{1f}{}\u{1f}{origin}", self.0)
    }
}

impl fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
