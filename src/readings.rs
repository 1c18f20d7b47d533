//! Hourly pollutant readings and raw-batch normalization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::source::SourceError;
use crate::timestamp::{self, normalize_timestamp};

const MAX_REPORTED_REJECTS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pollutants {
    pub pm2_5: f64,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
    pub o3: Option<f64>,
}

impl Pollutants {
    pub fn pm25_only(pm2_5: f64) -> Self {
        Self {
            pm2_5,
            pm10: None,
            co: None,
            no2: None,
            so2: None,
            o3: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub city: String,
    #[serde(rename = "timestamp", with = "timestamp::canonical")]
    pub instant: DateTime<Utc>,
    pub source: String,
    pub pollutants: Pollutants,
}

/// Parallel hourly arrays as delivered by a reading source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReadingBatch {
    pub timestamps: Vec<String>,
    pub pm2_5: Vec<Option<f64>>,
    pub pm10: Vec<Option<f64>>,
    pub co: Vec<Option<f64>>,
    pub no2: Vec<Option<f64>>,
    pub so2: Vec<Option<f64>>,
    pub o3: Vec<Option<f64>>,
}

impl RawReadingBatch {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn push(&mut self, timestamp: impl Into<String>, pm2_5: Option<f64>) {
        self.timestamps.push(timestamp.into());
        self.pm2_5.push(pm2_5);
        self.pm10.push(None);
        self.co.push(None);
        self.no2.push(None);
        self.so2.push(None);
        self.o3.push(None);
    }

    fn validate_lengths(&self) -> Result<(), SourceError> {
        let expected = self.timestamps.len();
        let columns = [
            ("pm2_5", self.pm2_5.len()),
            ("pm10", self.pm10.len()),
            ("co", self.co.len()),
            ("no2", self.no2.len()),
            ("so2", self.so2.len()),
            ("o3", self.o3.len()),
        ];
        for (field, found) in columns {
            if found != expected {
                return Err(SourceError::MismatchedSeries {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub processed: u64,
    pub accepted: u64,
    pub skipped_future: u64,
    pub missing_pm2_5: u64,
    pub duplicates_collapsed: u64,
    pub invalid_timestamps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub readings: Vec<Reading>,
    pub summary: IngestSummary,
}

/// Turns a raw batch into a strictly ordered, de-duplicated series.
///
/// Unparsable timestamps and null pm2_5 values drop the record only.
/// Instants after `ceiling` are discarded. Repeated instants keep the
/// value supplied last.
pub fn normalize_batch(
    city: &str,
    source: &str,
    batch: &RawReadingBatch,
    ceiling: DateTime<Utc>,
) -> Result<NormalizedBatch, SourceError> {
    batch.validate_lengths()?;

    let mut summary = IngestSummary::default();
    let mut by_instant: BTreeMap<DateTime<Utc>, Reading> = BTreeMap::new();
    let mut invalid_count = 0u64;

    for (idx, raw_ts) in batch.timestamps.iter().enumerate() {
        summary.processed += 1;

        let instant = match normalize_timestamp(raw_ts) {
            Ok(instant) => instant,
            Err(err) => {
                invalid_count += 1;
                debug!(
                    component = "readings",
                    event = "readings.normalize.invalid_timestamp",
                    raw = %raw_ts,
                    error = %err
                );
                if summary.invalid_timestamps.len() < MAX_REPORTED_REJECTS {
                    summary.invalid_timestamps.push(raw_ts.clone());
                }
                continue;
            }
        };

        if instant > ceiling {
            summary.skipped_future += 1;
            continue;
        }

        let Some(pm2_5) = batch.pm2_5[idx].filter(|v| v.is_finite()) else {
            summary.missing_pm2_5 += 1;
            continue;
        };

        let reading = Reading {
            city: city.to_string(),
            instant,
            source: source.to_string(),
            pollutants: Pollutants {
                pm2_5,
                pm10: batch.pm10[idx],
                co: batch.co[idx],
                no2: batch.no2[idx],
                so2: batch.so2[idx],
                o3: batch.o3[idx],
            },
        };

        if by_instant.insert(instant, reading).is_some() {
            summary.duplicates_collapsed += 1;
        }
    }

    let readings: Vec<Reading> = by_instant.into_values().collect();
    summary.accepted = readings.len() as u64;

    if invalid_count > 0 {
        warn!(
            component = "readings",
            event = "readings.normalize.dropped_invalid",
            city,
            invalid_timestamps = invalid_count
        );
    }

    info!(
        component = "readings",
        event = "readings.normalize.finish",
        city,
        processed = summary.processed,
        accepted = summary.accepted,
        skipped_future = summary.skipped_future,
        missing_pm2_5 = summary.missing_pm2_5,
        duplicates_collapsed = summary.duplicates_collapsed,
        ceiling = %timestamp::format_instant(ceiling)
    );

    Ok(NormalizedBatch { readings, summary })
}

/// Sorts by instant and keeps the last reading supplied per (city, instant).
pub fn dedupe_last_wins(readings: Vec<Reading>) -> (Vec<Reading>, u64) {
    let mut by_key: BTreeMap<(String, DateTime<Utc>), Reading> = BTreeMap::new();
    let mut collapsed = 0u64;
    for reading in readings {
        if by_key
            .insert((reading.city.clone(), reading.instant), reading)
            .is_some()
        {
            collapsed += 1;
        }
    }
    (by_key.into_values().collect(), collapsed)
}
