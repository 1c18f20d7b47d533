//! Base-row selection and query-instant to horizon-index alignment.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::{FeatureRow, FeatureSchema};
use crate::timestamp;

const HOUR_SECONDS: i64 = 3_600;

pub const DEFAULT_BASE_ROW_LOOKBACK: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BaseRowPolicy {
    /// Most recent row at or before now; an incomplete row is an error.
    #[default]
    Nearest,
    /// First complete row among the `lookback` most recent rows at or before now.
    LatestComplete { lookback: usize },
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("no feature row for '{city}' at or before {now_hour}")]
    NoBaseRow {
        city: String,
        now_hour: DateTime<Utc>,
    },
    #[error(
        "base row {base_time} has null features [{}] (policy {policy:?}, {scanned} candidate(s) scanned)",
        missing_features.join(", ")
    )]
    IncompleteBaseRow {
        base_time: DateTime<Utc>,
        missing_features: Vec<String>,
        policy: BaseRowPolicy,
        scanned: usize,
    },
    #[error(
        "horizon out of range: base_time={base_time} query_instant={query_instant} delta_hours={delta_hours} (supported 1..={max_horizon})"
    )]
    HorizonOutOfRange {
        base_time: DateTime<Utc>,
        query_instant: DateTime<Utc>,
        delta_hours: i64,
        max_horizon: u32,
    },
    #[error("prediction vector has {actual} entries, expected {expected}")]
    PredictionLength { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonAlignment {
    #[serde(with = "timestamp::canonical")]
    pub base_time: DateTime<Utc>,
    #[serde(with = "timestamp::canonical")]
    pub query_instant: DateTime<Utc>,
    /// 1-based.
    pub horizon_hours: u32,
    #[serde(with = "timestamp::canonical")]
    pub target_time: DateTime<Utc>,
}

impl HorizonAlignment {
    /// Zero-based index into an H-length prediction vector.
    pub fn prediction_index(&self) -> usize {
        self.horizon_hours as usize - 1
    }

    pub fn select(&self, predictions: &[f64], max_horizon: u32) -> Result<f64, AlignError> {
        if predictions.len() != max_horizon as usize {
            return Err(AlignError::PredictionLength {
                expected: max_horizon as usize,
                actual: predictions.len(),
            });
        }
        predictions
            .get(self.prediction_index())
            .copied()
            .ok_or(AlignError::PredictionLength {
                expected: max_horizon as usize,
                actual: predictions.len(),
            })
    }
}

/// Whole hours from `base_time` to `query_instant`, rounded toward negative
/// infinity.
pub fn delta_hours(base_time: DateTime<Utc>, query_instant: DateTime<Utc>) -> i64 {
    let delta = query_instant - base_time;
    let secs = delta.num_seconds();
    let floored = secs.div_euclid(HOUR_SECONDS);
    // Sub-second remainder below zero still belongs to the previous hour.
    if secs % HOUR_SECONDS == 0 && delta < Duration::seconds(secs) {
        floored - 1
    } else {
        floored
    }
}

pub fn align_horizon(
    base_time: DateTime<Utc>,
    query_instant: DateTime<Utc>,
    max_horizon: u32,
) -> Result<HorizonAlignment, AlignError> {
    let delta = delta_hours(base_time, query_instant);
    if delta < 1 || delta > i64::from(max_horizon) {
        return Err(AlignError::HorizonOutOfRange {
            base_time,
            query_instant,
            delta_hours: delta,
            max_horizon,
        });
    }

    let alignment = HorizonAlignment {
        base_time,
        query_instant,
        horizon_hours: delta as u32,
        target_time: base_time + Duration::hours(delta),
    };

    debug!(
        component = "horizon",
        event = "horizon.align.resolved",
        base_time = %timestamp::format_instant(base_time),
        query_instant = %query_instant.to_rfc3339(),
        horizon_hours = alignment.horizon_hours
    );

    Ok(alignment)
}

/// Picks the base row from `candidates` according to `policy`.
///
/// Candidates may arrive in any order; rows after `now_hour` are ignored.
pub fn select_base_row<'a>(
    city: &str,
    candidates: &'a [FeatureRow],
    schema: &FeatureSchema,
    now_hour: DateTime<Utc>,
    policy: BaseRowPolicy,
) -> Result<&'a FeatureRow, AlignError> {
    let mut eligible: Vec<&FeatureRow> = candidates
        .iter()
        .filter(|row| row.city == city && row.instant <= now_hour)
        .collect();
    eligible.sort_by(|a, b| b.instant.cmp(&a.instant));

    let Some(nearest) = eligible.first().copied() else {
        return Err(AlignError::NoBaseRow {
            city: city.to_string(),
            now_hour,
        });
    };

    let (chosen, scanned) = match policy {
        BaseRowPolicy::Nearest => (nearest.has_complete_features().then_some(nearest), 1),
        BaseRowPolicy::LatestComplete { lookback } => {
            let window = &eligible[..eligible.len().min(lookback.max(1))];
            (
                window.iter().copied().find(|row| row.has_complete_features()),
                window.len(),
            )
        }
    };

    match chosen {
        Some(row) => {
            info!(
                component = "horizon",
                event = "horizon.base_row.selected",
                city,
                base_time = %timestamp::format_instant(row.instant),
                now_hour = %timestamp::format_instant(now_hour),
                policy = ?policy,
                skipped = eligible.iter().position(|r| r.instant == row.instant).unwrap_or(0)
            );
            Ok(row)
        }
        None => Err(AlignError::IncompleteBaseRow {
            base_time: nearest.instant,
            missing_features: nearest.missing_feature_names(schema),
            policy,
            scanned,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 26, 12, 0, 0).unwrap()
    }

    #[test]
    fn delta_floors_fractional_hours() {
        let b = base();
        assert_eq!(delta_hours(b, b + Duration::minutes(119)), 1);
        assert_eq!(delta_hours(b, b + Duration::minutes(59)), 0);
        assert_eq!(delta_hours(b, b - Duration::minutes(1)), -1);
        assert_eq!(delta_hours(b, b - Duration::milliseconds(1)), -1);
        assert_eq!(delta_hours(b, b + Duration::hours(72)), 72);
    }

    #[test]
    fn out_of_range_error_names_the_values() {
        let b = base();
        let err = align_horizon(b, b + Duration::hours(73), 72).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("delta_hours=73"), "{msg}");
        assert!(msg.contains("base_time=2026-01-26 12:00:00 UTC"), "{msg}");
    }

    #[test]
    fn select_requires_full_length_vector() {
        let b = base();
        let alignment = align_horizon(b, b + Duration::hours(2), 3).unwrap();
        assert_eq!(alignment.select(&[1.0, 2.0, 3.0], 3).unwrap(), 2.0);
        assert!(matches!(
            alignment.select(&[1.0, 2.0], 3),
            Err(AlignError::PredictionLength {
                expected: 3,
                actual: 2
            })
        ));
    }
}
