//! Calibration records, registration drafts and references.

use crate::error::{Error, Result};
use crate::timestamp::ObsTime;
use crate::version::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Instrument-specific metadata, opaque to the store except when a
/// selector or family policy names a field.
pub type Attributes = Map<String, Value>;

/// Fields owned by the store; callers cannot set them as attributes.
pub const RESERVED_FIELDS: [&str; 9] = [
    "id",
    "instrument_name",
    "filename",
    "cal_type",
    "datetime_obs",
    "origin",
    "version",
    "last_updated",
    "version_family",
];

/// Namespace for deterministic calibration ids.
const CALIBRATION_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a0c_33e1_9b5d_4c02_8f7e_d2a4_17c9_5e01);

/// Where a calibration was produced. Each origin numbers its versions
/// independently.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Origin {
    Keck,
    #[default]
    Local,
    Other(String),
}

impl Origin {
    pub fn as_str(&self) -> &str {
        match self {
            Origin::Keck => "KECK",
            Origin::Local => "LOCAL",
            Origin::Other(name) => name,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "KECK" => Ok(Origin::Keck),
            "LOCAL" => Ok(Origin::Local),
            "" => Err(Error::InvalidOrigin("origin must not be empty".into())),
            other
                if other
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') =>
            {
                Ok(Origin::Other(other.to_string()))
            }
            other => Err(Error::InvalidOrigin(other.to_string())),
        }
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Named metadata lookup used by version-family keys and selectors.
pub trait FieldSource {
    /// Render a field as text, or `None` when absent or null.
    fn field(&self, name: &str) -> Option<String>;
}

fn attribute_text(attributes: &Attributes, name: &str) -> Option<String> {
    match attributes.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Metadata for a calibration that has not been registered yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCalibration {
    pub filename: String,
    pub cal_type: String,
    pub datetime_obs: ObsTime,
    #[serde(default)]
    pub attributes: Attributes,
}

impl NewCalibration {
    pub fn new(filename: impl Into<String>, cal_type: impl Into<String>, datetime_obs: ObsTime) -> Self {
        Self {
            filename: filename.into(),
            cal_type: cal_type.into(),
            datetime_obs,
            attributes: Attributes::new(),
        }
    }

    /// Add an instrument-specific attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Build a draft from a flat field map, as produced by a data model's
    /// record export.
    ///
    /// `filename`, `cal_type` and `datetime_obs` are required. A caller
    /// supplied `id` is discarded because registration always assigns one;
    /// the other store-owned fields are rejected.
    pub fn from_fields(mut fields: Attributes) -> Result<Self> {
        fields.remove("id");
        let filename = take_required_string(&mut fields, "filename")?;
        let cal_type = take_required_string(&mut fields, "cal_type")?;
        let datetime_obs = take_required_string(&mut fields, "datetime_obs")?;
        let datetime_obs = ObsTime::parse(&datetime_obs)
            .map_err(|e| Error::InvalidMetadata(format!("datetime_obs: {e}")))?;

        if let Some(reserved) = RESERVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
            return Err(Error::InvalidMetadata(format!(
                "{reserved} is assigned by the store and cannot be supplied"
            )));
        }

        let draft = Self {
            filename,
            cal_type,
            datetime_obs,
            attributes: fields,
        };
        draft.validate()?;
        Ok(draft)
    }

    /// Check required fields are present and attributes do not shadow them.
    pub fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(Error::InvalidMetadata("filename is required".into()));
        }
        if self.cal_type.trim().is_empty() {
            return Err(Error::InvalidMetadata("cal_type is required".into()));
        }
        if let Some(reserved) = RESERVED_FIELDS
            .iter()
            .find(|f| self.attributes.contains_key(**f))
        {
            return Err(Error::InvalidMetadata(format!(
                "attribute {reserved} shadows a store-owned field"
            )));
        }
        Ok(())
    }
}

fn take_required_string(fields: &mut Attributes, name: &str) -> Result<String> {
    match fields.remove(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::Null) | None => Err(Error::InvalidMetadata(format!("{name} is required"))),
        Some(Value::String(_)) => Err(Error::InvalidMetadata(format!("{name} is empty"))),
        Some(other) => Err(Error::InvalidMetadata(format!(
            "{name} must be a string, got {other}"
        ))),
    }
}

impl FieldSource for NewCalibration {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "filename" => Some(self.filename.clone()),
            "cal_type" => Some(self.cal_type.clone()),
            "datetime_obs" => Some(self.datetime_obs.to_string()),
            other => attribute_text(&self.attributes, other),
        }
    }
}

/// One calibration as stored in a metadata index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub id: Uuid,
    pub instrument_name: String,
    pub filename: String,
    pub cal_type: String,
    pub datetime_obs: ObsTime,
    pub origin: Origin,
    pub version: Version,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl CalibrationRecord {
    /// Assemble a record from a registration draft.
    pub fn from_draft(
        id: Uuid,
        instrument_name: impl Into<String>,
        draft: &NewCalibration,
        origin: Origin,
        version: Version,
        last_updated: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            instrument_name: instrument_name.into(),
            filename: draft.filename.clone(),
            cal_type: draft.cal_type.clone(),
            datetime_obs: draft.datetime_obs,
            origin,
            version,
            attributes: draft.attributes.clone(),
            last_updated,
        }
    }

    /// Look up an instrument-specific attribute.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Flatten into a single field map (store-owned fields plus attributes).
    pub fn to_fields(&self) -> Attributes {
        let mut fields = self.attributes.clone();
        fields.insert("id".into(), Value::String(self.id.to_string()));
        fields.insert("instrument_name".into(), Value::String(self.instrument_name.clone()));
        fields.insert("filename".into(), Value::String(self.filename.clone()));
        fields.insert("cal_type".into(), Value::String(self.cal_type.clone()));
        fields.insert("datetime_obs".into(), Value::String(self.datetime_obs.to_string()));
        fields.insert("origin".into(), Value::String(self.origin.to_string()));
        fields.insert("version".into(), Value::String(self.version.to_string()));
        fields.insert(
            "last_updated".into(),
            Value::String(crate::timestamp::format_last_updated(self.last_updated)),
        );
        fields
    }
}

impl FieldSource for CalibrationRecord {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "instrument_name" => Some(self.instrument_name.clone()),
            "filename" => Some(self.filename.clone()),
            "cal_type" => Some(self.cal_type.clone()),
            "datetime_obs" => Some(self.datetime_obs.to_string()),
            "origin" => Some(self.origin.to_string()),
            "version" => Some(self.version.to_string()),
            other => attribute_text(&self.attributes, other),
        }
    }
}

/// The ways a caller can name a calibration to retrieve.
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationRef {
    Id(Uuid),
    Filename(String),
    Record(Box<CalibrationRecord>),
}

impl CalibrationRef {
    pub fn filename(name: impl Into<String>) -> Self {
        Self::Filename(name.into())
    }
}

impl From<Uuid> for CalibrationRef {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

impl From<CalibrationRecord> for CalibrationRef {
    fn from(record: CalibrationRecord) -> Self {
        Self::Record(Box::new(record))
    }
}

impl From<&CalibrationRecord> for CalibrationRef {
    fn from(record: &CalibrationRecord) -> Self {
        Self::Record(Box::new(record.clone()))
    }
}

impl fmt::Display for CalibrationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationRef::Id(id) => write!(f, "id {id}"),
            CalibrationRef::Filename(name) => write!(f, "filename {name}"),
            CalibrationRef::Record(record) => write!(f, "id {}", record.id),
        }
    }
}

/// How new calibration ids are generated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Random UUID v4.
    #[default]
    Random,
    /// UUID v5 derived from instrument, filename, origin and version, so
    /// replaying a registration reproduces the same id.
    Deterministic,
}

impl IdStrategy {
    pub fn generate(
        &self,
        instrument_name: &str,
        filename: &str,
        origin: &Origin,
        version: Version,
    ) -> Uuid {
        match self {
            IdStrategy::Random => Uuid::new_v4(),
            IdStrategy::Deterministic => {
                let name = format!("{instrument_name}/{filename}/{origin}/{version}");
                Uuid::new_v5(&CALIBRATION_ID_NAMESPACE, name.as_bytes())
            }
        }
    }
}

/// True when `value` is a hyphenated RFC 4122 version 4 UUID.
pub fn is_valid_uuid_v4(value: &str) -> bool {
    if value.len() != 36 {
        return false;
    }
    match Uuid::try_parse(value) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == uuid::Variant::RFC4122,
        Err(_) => false,
    }
}
