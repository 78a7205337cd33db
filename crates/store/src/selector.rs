//! Calibration selection.
//!
//! A selector maps a pipeline input to exactly one calibration in three
//! stages, always run in order:
//!
//! 1. [`CalibrationSelector::get_candidates`] queries an index. Required.
//! 2. [`CalibrationSelector::select_best`] picks from the candidates. The
//!    default takes the first one, so ordering belongs in stage 1.
//! 3. [`CalibrationSelector::select_fallback`] runs only when stage 2 comes
//!    back empty. The default finds nothing.
//!
//! [`select`] drives the stages and turns "nothing found" into
//! [`StoreError::NoCalibrationFound`].

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use calstore_core::{Attributes, CalibrationRecord, FieldSource, ObsTime};
use calstore_metadata::{CalibrationQuery, MetadataIndex};
use serde_json::Value;
use tracing::instrument;

/// Three-stage selection strategy.
#[async_trait]
pub trait CalibrationSelector: Send + Sync {
    /// What the pipeline hands the selector, usually observation metadata.
    type Input: ?Sized + Sync;

    /// Name used in logs and in `NoCalibrationFound`.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Query `index` for candidate calibrations. Must not mutate the index.
    async fn get_candidates(
        &self,
        input: &Self::Input,
        index: &dyn MetadataIndex,
    ) -> StoreResult<Vec<CalibrationRecord>>;

    /// Pick one candidate.
    fn select_best(
        &self,
        _input: &Self::Input,
        candidates: Vec<CalibrationRecord>,
    ) -> Option<CalibrationRecord> {
        candidates.into_iter().next()
    }

    /// Last resort when no candidate was chosen.
    async fn select_fallback(
        &self,
        _input: &Self::Input,
        _index: &dyn MetadataIndex,
    ) -> StoreResult<Option<CalibrationRecord>> {
        Ok(None)
    }
}

/// Run a selector's stages against `index`.
#[instrument(skip_all, fields(selector = selector.name()))]
pub async fn select<S>(
    selector: &S,
    input: &S::Input,
    index: &dyn MetadataIndex,
) -> StoreResult<CalibrationRecord>
where
    S: CalibrationSelector + ?Sized,
{
    let candidates = selector.get_candidates(input, index).await?;
    let count = candidates.len();
    if let Some(best) = selector.select_best(input, candidates) {
        tracing::debug!(candidates = count, id = %best.id, "selected calibration");
        return Ok(best);
    }
    if let Some(fallback) = selector.select_fallback(input, index).await? {
        tracing::debug!(id = %fallback.id, "selected fallback calibration");
        return Ok(fallback);
    }
    Err(StoreError::NoCalibrationFound(selector.name().to_string()))
}

/// Observation metadata handed to a selector.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub datetime_obs: ObsTime,
    pub attributes: Attributes,
}

impl Observation {
    pub fn new(datetime_obs: ObsTime) -> Self {
        Self {
            datetime_obs,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

impl FieldSource for Observation {
    fn field(&self, name: &str) -> Option<String> {
        if name == "datetime_obs" {
            return Some(self.datetime_obs.to_string());
        }
        match self.attributes.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Picks the calibration of one type taken closest in time to the
/// observation.
///
/// Candidates must also agree with the observation on every match field.
/// Ties in distance go to the higher version. With a window, only
/// calibrations within `datetime_obs ± window` are candidates; the fallback
/// optionally widens the search to all times.
#[derive(Clone, Debug)]
pub struct NearestInTimeSelector {
    cal_type: String,
    match_fields: Vec<String>,
    window: Option<time::Duration>,
    fallback_without_window: bool,
}

impl NearestInTimeSelector {
    pub fn new(cal_type: impl Into<String>) -> Self {
        Self {
            cal_type: cal_type.into(),
            match_fields: Vec::new(),
            window: None,
            fallback_without_window: false,
        }
    }

    /// Require candidates to carry the observation's value for `field`.
    pub fn matching(mut self, field: impl Into<String>) -> Self {
        self.match_fields.push(field.into());
        self
    }

    /// Only consider calibrations within `window` of the observation.
    pub fn within(mut self, window: time::Duration) -> Self {
        self.window = Some(window.abs());
        self
    }

    /// When the window holds nothing, take the nearest calibration at any
    /// time.
    pub fn fallback_to_any_time(mut self) -> Self {
        self.fallback_without_window = true;
        self
    }

    fn base_query(&self, input: &Observation) -> StoreResult<CalibrationQuery> {
        let mut query = CalibrationQuery::new().cal_type(&self.cal_type);
        for field in &self.match_fields {
            let value = input.attributes.get(field).cloned().ok_or_else(|| {
                StoreError::InvalidMetadata(format!("observation is missing {field}"))
            })?;
            query = query.attribute(field, value);
        }
        Ok(query)
    }

    fn nearest_first(input: &Observation, mut records: Vec<CalibrationRecord>) -> Vec<CalibrationRecord> {
        records.sort_by(|a, b| {
            a.datetime_obs
                .abs_diff(&input.datetime_obs)
                .cmp(&b.datetime_obs.abs_diff(&input.datetime_obs))
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| a.datetime_obs.cmp(&b.datetime_obs))
        });
        records
    }
}

#[async_trait]
impl CalibrationSelector for NearestInTimeSelector {
    type Input = Observation;

    fn name(&self) -> &str {
        "NearestInTimeSelector"
    }

    async fn get_candidates(
        &self,
        input: &Observation,
        index: &dyn MetadataIndex,
    ) -> StoreResult<Vec<CalibrationRecord>> {
        let mut query = self.base_query(input)?;
        if let Some(window) = self.window {
            query = query.date_time_range(
                Some(input.datetime_obs.saturating_add(-window)),
                Some(input.datetime_obs.saturating_add(window)),
            );
        }
        let records = index.query(&query).await?;
        Ok(Self::nearest_first(input, records))
    }

    async fn select_fallback(
        &self,
        input: &Observation,
        index: &dyn MetadataIndex,
    ) -> StoreResult<Option<CalibrationRecord>> {
        if self.window.is_none() || !self.fallback_without_window {
            return Ok(None);
        }
        let records = index.query(&self.base_query(input)?).await?;
        Ok(Self::nearest_first(input, records).into_iter().next())
    }
}
