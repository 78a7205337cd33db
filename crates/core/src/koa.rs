//! Archive naming rules for calibration artifacts.
//!
//! Archived files are named `{prefix}.{YYYYMMDD}.{SSSSS.ss}.{ext}` where the
//! middle component is seconds since UTC midnight, and filed under
//! `/{INSTRUMENT}/{YYYY}/{YYYYMMDD}/...`.

use crate::error::{Error, Result};
use crate::timestamp::ObsTime;
use time::Time;
use time::macros::format_description;

/// Default artifact extension.
pub const DEFAULT_EXTENSION: &str = "fits";

fn seconds_since_midnight(t: Time) -> f64 {
    f64::from(t.hour()) * 3600.0
        + f64::from(t.minute()) * 60.0
        + f64::from(t.second())
        + f64::from(t.nanosecond()) / 1e9
}

fn validate_date_obs(date_obs: &str) -> Result<()> {
    if date_obs.len() == 8 && date_obs.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::InvalidMetadata(format!(
            "date_obs must be YYYYMMDD, got {date_obs:?}"
        )))
    }
}

/// Build an archive id such as `HB.20240924.45296.78.fits`.
///
/// `date_obs` is `YYYYMMDD` and `utc_obs` is `HH:MM:SS[.fff]`.
pub fn koa_id(prefix: &str, date_obs: &str, utc_obs: &str, ext: &str) -> Result<String> {
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(Error::InvalidMetadata(format!(
            "instrument prefix must be alphabetic, got {prefix:?}"
        )));
    }
    validate_date_obs(date_obs)?;
    let utc = Time::parse(
        utc_obs,
        format_description!("[hour]:[minute]:[second][optional [.[subsecond]]]"),
    )
    .map_err(|e| Error::InvalidTimestamp(format!("{utc_obs}: {e}")))?;

    let seconds = seconds_since_midnight(utc);
    let ext = ext.trim_start_matches('.');
    Ok(format!("{prefix}.{date_obs}.{seconds:08.2}.{ext}"))
}

/// Timestamp component of an archive id: `YYYYMMDD.SSSSS.ss`.
pub fn koa_id_timestamp(datetime_obs: &ObsTime) -> String {
    let dt = datetime_obs.as_datetime();
    let seconds = seconds_since_midnight(dt.time());
    format!(
        "{:04}{:02}{:02}.{seconds:08.2}",
        dt.year(),
        u8::from(dt.month()),
        dt.day()
    )
}

/// Archive path of a raw or reduced frame:
/// `/{INSTRUMENT}/{YYYY}/{YYYYMMDD}/{data_level}/{koa_id}`.
pub fn koa_filepath(
    instrument: &str,
    prefix: &str,
    data_level: &str,
    date_obs: &str,
    utc_obs: &str,
) -> Result<String> {
    let id = koa_id(prefix, date_obs, utc_obs, DEFAULT_EXTENSION)?;
    let year = &date_obs[..4];
    Ok(format!(
        "/{}/{year}/{date_obs}/{data_level}/{id}",
        instrument.to_uppercase()
    ))
}

/// Archive file handle of a calibration:
/// `/{instrument}/{YYYY}/{YYYYMMDD}/{koa_id}`.
pub fn koa_filehandle(instrument: &str, datetime_obs: &ObsTime, koa_id: &str) -> String {
    let dt = datetime_obs.as_datetime();
    format!(
        "/{instrument}/{:04}/{:04}{:02}{:02}/{koa_id}",
        dt.year(),
        dt.year(),
        u8::from(dt.month()),
        dt.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_koa_id() {
        let id = koa_id("HB", "20240924", "12:34:56.78", "fits").unwrap();
        assert_eq!(id, "HB.20240924.45296.78.fits");
    }

    #[test]
    fn test_koa_id_pads_early_times() {
        let id = koa_id("HR", "20240924", "00:00:05", ".fits").unwrap();
        assert_eq!(id, "HR.20240924.00005.00.fits");
    }

    #[test]
    fn test_koa_id_rejects_bad_input() {
        assert!(koa_id("H1", "20240924", "12:00:00", "fits").is_err());
        assert!(koa_id("HB", "2024-09-24", "12:00:00", "fits").is_err());
        assert!(koa_id("HB", "20240924", "noon", "fits").is_err());
    }

    #[test]
    fn test_koa_filepath() {
        let path = koa_filepath("hispec", "HR", "lev0", "20240924", "03:25:45.67").unwrap();
        assert_eq!(path, "/HISPEC/2024/20240924/lev0/HR.20240924.12345.67.fits");
    }

    #[test]
    fn test_koa_filehandle_and_timestamp() {
        let obs = ObsTime::parse("2024-09-24T12:34:56.780").unwrap();
        assert_eq!(koa_id_timestamp(&obs), "20240924.45296.78");
        assert_eq!(
            koa_filehandle("HISPEC", &obs, "HB.20240924.45296.78.fits"),
            "/HISPEC/2024/20240924/HB.20240924.45296.78.fits"
        );
    }
}
