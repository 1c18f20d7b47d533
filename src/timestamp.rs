//! Canonical UTC hour instants from heterogeneous timestamp text.
//!
//! Accepted encodings (all resolve to the same physical instant):
//! - `YYYY-MM-DDTHH:MM` (naive, implicitly UTC)
//! - `YYYY-MM-DDTHH:MM:SS[.fff]` (naive, implicitly UTC)
//! - any of the above with a trailing `Z`
//! - any of the above with an explicit `+HH:MM` / `-HH:MM` offset
//!
//! A space may stand in for the `T` separator.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

const HOUR_SECONDS: i64 = 3_600;

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];
const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%dT%H:%M%:z",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("timestamp out of range: {0}s since epoch")]
    OutOfRange(i64),
}

/// Parses `raw` into a UTC instant at full precision.
pub fn parse_utc_instant(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::InvalidTimestamp(raw.to_string()));
    }

    let text = trimmed.replacen(' ', "T", 1);
    let text = if text.ends_with('Z') || text.ends_with('z') {
        format!("{}+00:00", &text[..text.len() - 1])
    } else {
        text
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(&text, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(TimestampError::InvalidTimestamp(raw.to_string()))
}

/// Parses `raw` and truncates the result to the whole UTC hour.
pub fn normalize_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    floor_to_hour(parse_utc_instant(raw)?)
}

pub fn floor_to_hour(instant: DateTime<Utc>) -> Result<DateTime<Utc>, TimestampError> {
    let secs = instant.timestamp().div_euclid(HOUR_SECONDS) * HOUR_SECONDS;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(TimestampError::OutOfRange(secs))
}

pub fn is_hour_aligned(instant: DateTime<Utc>) -> bool {
    instant.timestamp().rem_euclid(HOUR_SECONDS) == 0 && instant.timestamp_subsec_nanos() == 0
}

/// The no-future ceiling for a run. Compute once and thread it through.
pub fn now_hour() -> DateTime<Utc> {
    let now = Utc::now();
    floor_to_hour(now).unwrap_or(now)
}

/// Canonical storage text, e.g. `2026-01-26T23:00:00Z`.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Whole hours since the epoch; used as the series index.
pub(crate) fn hour_index(instant: DateTime<Utc>) -> i64 {
    instant.timestamp().div_euclid(HOUR_SECONDS)
}

pub(crate) fn instant_from_hour_index(index: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(index.checked_mul(HOUR_SECONDS)?, 0).single()
}

pub(crate) mod canonical {
    //! Serde adapter writing instants as canonical text.

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        instant: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_instant(*instant))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_utc_instant(&raw).map_err(serde::de::Error::custom)
    }
}
