//! Hourly pm2_5 series to feature rows with multi-step-ahead targets.
//!
//! Feature columns only ever read readings at or before the row's own
//! instant. Target `h` reads the reading exactly `h` hours later and is
//! null when that reading does not exist yet.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::readings::Reading;
use crate::timestamp::{self, hour_index, instant_from_hour_index, is_hour_aligned};

const MAX_REPORTED_GAP_RANGES: usize = 256;
const CALENDAR_COLUMNS: [&str; 4] = ["hour", "day_of_week", "is_weekend", "month"];

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
/// Upper bound on `horizon_hours` (two weeks).
pub const MAX_HORIZON_HOURS: u32 = 24 * 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub lags_hours: Vec<u32>,
    pub mean_windows_hours: Vec<u32>,
    pub std_windows_hours: Vec<u32>,
    pub horizon_hours: u32,
    pub history_margin: u32,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags_hours: vec![1, 3, 24],
            mean_windows_hours: vec![3, 24],
            std_windows_hours: vec![24],
            horizon_hours: 72,
            history_margin: 5,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn with_horizon(horizon_hours: u32) -> Self {
        Self {
            horizon_hours,
            ..Self::default()
        }
    }

    /// Longest look-back of any feature column, in hours (diff needs 1).
    pub fn max_lookback_hours(&self) -> u32 {
        self.lags_hours
            .iter()
            .chain(&self.mean_windows_hours)
            .chain(&self.std_windows_hours)
            .copied()
            .chain(std::iter::once(1))
            .max()
            .unwrap_or(1)
    }

    /// Fewest observations that can yield a row with complete features
    /// and a complete target vector, plus the configured margin.
    pub fn required_history(&self) -> usize {
        (self.max_lookback_hours() as usize)
            .saturating_add(self.horizon_hours as usize)
            .saturating_add(self.history_margin as usize)
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.horizon_hours == 0 {
            return Err(FeatureError::InvalidConfig(
                "horizon_hours must be > 0".to_string(),
            ));
        }
        if self.horizon_hours > MAX_HORIZON_HOURS {
            return Err(FeatureError::InvalidConfig(format!(
                "horizon_hours must be <= {MAX_HORIZON_HOURS}, got {}",
                self.horizon_hours
            )));
        }

        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(FeatureError::InvalidConfig(format!(
                "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
            )));
        }

        for (label, values) in [
            ("lags_hours", &self.lags_hours),
            ("mean_windows_hours", &self.mean_windows_hours),
            ("std_windows_hours", &self.std_windows_hours),
        ] {
            let mut seen = HashSet::new();
            for value in values {
                if *value == 0 {
                    return Err(FeatureError::InvalidConfig(format!(
                        "{label} entries must be > 0"
                    )));
                }
                if !seen.insert(*value) {
                    return Err(FeatureError::InvalidConfig(format!(
                        "{label} entries must be unique"
                    )));
                }
            }
        }

        if self.std_windows_hours.iter().any(|w| *w < 2) {
            return Err(FeatureError::InvalidConfig(
                "std_windows_hours entries must be >= 2".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Calendar,
    Lag { hours: u32 },
    RollingMean { hours: u32 },
    RollingStd { hours: u32 },
    Diff { hours: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub horizon_hours: u32,
    pub columns: Vec<FeatureColumn>,
    pub target_columns: Vec<String>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFeatures {
    pub hour: u32,
    /// 0 = Monday.
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: bool,
}

impl CalendarFeatures {
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        let day_of_week = instant.weekday().num_days_from_monday();
        Self {
            hour: instant.hour(),
            day_of_week,
            month: instant.month(),
            is_weekend: day_of_week >= 5,
        }
    }

    fn values(&self) -> [f64; 4] {
        [
            self.hour as f64,
            self.day_of_week as f64,
            if self.is_weekend { 1.0 } else { 0.0 },
            self.month as f64,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub city: String,
    #[serde(rename = "timestamp", with = "timestamp::canonical")]
    pub instant: DateTime<Utc>,
    pub pm2_5: f64,
    pub calendar: CalendarFeatures,
    /// One entry per schema column, in schema order.
    pub values: Vec<Option<f64>>,
    /// `targets[h - 1]` is pm2_5 at `instant + h` hours.
    pub targets: Vec<Option<f64>>,
    pub schema_fingerprint: String,
}

impl FeatureRow {
    pub fn has_complete_features(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }

    pub fn has_complete_targets(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(Option::is_some)
    }

    pub fn is_trainable(&self) -> bool {
        self.has_complete_features() && self.has_complete_targets()
    }

    pub fn feature_vector(&self) -> Option<Vec<f64>> {
        self.values.iter().copied().collect()
    }

    pub fn target_vector(&self) -> Option<Vec<f64>> {
        if self.targets.is_empty() {
            return None;
        }
        self.targets.iter().copied().collect()
    }

    pub fn value(&self, column_index: usize) -> Option<f64> {
        self.values.get(column_index).copied().flatten()
    }

    /// 1-based horizon lookup.
    pub fn target(&self, horizon_hours: u32) -> Option<f64> {
        let idx = (horizon_hours as usize).checked_sub(1)?;
        self.targets.get(idx).copied().flatten()
    }

    pub fn missing_feature_names(&self, schema: &FeatureSchema) -> Vec<String> {
        self.values
            .iter()
            .zip(&schema.columns)
            .filter(|(value, _)| value.is_none())
            .map(|(_, column)| column.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_points: u64,
    pub dropped_future: u64,
    pub output_rows: u64,
    pub complete_rows: u64,
    pub trainable_rows: u64,
    pub missing_hours: u64,
    pub gap_ranges: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error(
        "insufficient history: {available} observations at or before the ceiling, {required} required (max look-back + {horizon_hours}h horizon + margin)"
    )]
    InsufficientHistory {
        available: usize,
        required: usize,
        horizon_hours: u32,
    },
    #[error("series out of order: {current} follows {previous}")]
    OutOfOrder {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("reading instant {0} is not aligned to a whole UTC hour")]
    UnalignedInstant(DateTime<Utc>),
    #[error("reading for city '{found}' in a series for '{expected}' at {instant}")]
    ForeignReading {
        expected: String,
        found: String,
        instant: DateTime<Utc>,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Trailing run of consecutive hourly values; cleared at every gap.
#[derive(Debug, Clone)]
struct SeriesWindow {
    values: VecDeque<f64>,
    max_window: usize,
}

impl SeriesWindow {
    fn new(max_window: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn reset(&mut self) {
        self.values.clear();
    }

    fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.max_window {
            self.values.pop_front();
        }
    }

    fn tail(&self, w: usize) -> Option<impl Iterator<Item = f64> + '_> {
        if w == 0 || self.values.len() < w {
            return None;
        }
        Some(self.values.range(self.values.len() - w..).copied())
    }

    fn mean(&self, w: usize) -> Option<f64> {
        let sum: f64 = self.tail(w)?.sum();
        Some(sum / w as f64)
    }

    /// Sample standard deviation (n - 1 denominator).
    fn std(&self, w: usize) -> Option<f64> {
        if w < 2 {
            return None;
        }
        let mean = self.mean(w)?;
        let sum_sq: f64 = self
            .tail(w)?
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum();
        Some((sum_sq / (w - 1) as f64).sqrt())
    }
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns: Vec<FeatureColumn> = CALENDAR_COLUMNS
        .iter()
        .map(|name| FeatureColumn {
            name: (*name).to_string(),
            kind: FeatureKind::Calendar,
        })
        .collect();

    for hours in &cfg.lags_hours {
        columns.push(FeatureColumn {
            name: format!("pm2_5_lag_{hours}h"),
            kind: FeatureKind::Lag { hours: *hours },
        });
    }
    for hours in &cfg.mean_windows_hours {
        columns.push(FeatureColumn {
            name: format!("pm2_5_roll_mean_{hours}h"),
            kind: FeatureKind::RollingMean { hours: *hours },
        });
    }
    for hours in &cfg.std_windows_hours {
        columns.push(FeatureColumn {
            name: format!("pm2_5_roll_std_{hours}h"),
            kind: FeatureKind::RollingStd { hours: *hours },
        });
    }
    columns.push(FeatureColumn {
        name: "pm2_5_diff_1h".to_string(),
        kind: FeatureKind::Diff { hours: 1 },
    });

    let target_columns: Vec<String> = (1..=cfg.horizon_hours)
        .map(|h| format!("target_pm2_5_t_plus_{h}h"))
        .collect();

    let fingerprint = schema_fingerprint(cfg, &columns, &target_columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        horizon_hours = cfg.horizon_hours,
        column_count = columns.len(),
        fingerprint = %fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        horizon_hours: cfg.horizon_hours,
        columns,
        target_columns,
    }
}

/// Builds one feature row per reading at or before `ceiling`, in order.
///
/// `readings` must be strictly increasing by instant and belong to `city`.
/// Rows with null features or targets are kept; filter with
/// [`FeatureRow::has_complete_features`] / [`FeatureRow::is_trainable`].
pub fn build_feature_rows(
    city: &str,
    readings: &[Reading],
    cfg: &FeatureConfig,
    ceiling: DateTime<Utc>,
) -> Result<(FeatureSchema, Vec<FeatureRow>, FeatureBuildReport), FeatureError> {
    cfg.validate()?;

    info!(
        component = "features",
        event = "features.build.start",
        city,
        input_points = readings.len(),
        horizon_hours = cfg.horizon_hours,
        ceiling = %timestamp::format_instant(ceiling)
    );

    let mut report = FeatureBuildReport {
        input_points: readings.len() as u64,
        ..FeatureBuildReport::default()
    };

    let mut series: Vec<&Reading> = Vec::with_capacity(readings.len());
    for reading in readings {
        if reading.city != city {
            return Err(FeatureError::ForeignReading {
                expected: city.to_string(),
                found: reading.city.clone(),
                instant: reading.instant,
            });
        }
        if !is_hour_aligned(reading.instant) {
            return Err(FeatureError::UnalignedInstant(reading.instant));
        }
        if let Some(previous) = series.last() {
            if reading.instant <= previous.instant {
                return Err(FeatureError::OutOfOrder {
                    previous: previous.instant,
                    current: reading.instant,
                });
            }
        }
        if reading.instant > ceiling {
            report.dropped_future += 1;
            continue;
        }
        series.push(reading);
    }

    let required = cfg.required_history();
    if series.len() < required {
        return Err(FeatureError::InsufficientHistory {
            available: series.len(),
            required,
            horizon_hours: cfg.horizon_hours,
        });
    }

    let schema = build_feature_schema(cfg);
    let by_hour: HashMap<i64, f64> = series
        .iter()
        .map(|r| (hour_index(r.instant), r.pollutants.pm2_5))
        .collect();

    let max_window = cfg
        .mean_windows_hours
        .iter()
        .chain(&cfg.std_windows_hours)
        .copied()
        .max()
        .unwrap_or(1) as usize;
    let mut window = SeriesWindow::new(max_window.max(1));
    let mut previous_idx: Option<i64> = None;
    let mut rows = Vec::with_capacity(series.len());

    for reading in &series {
        let idx = hour_index(reading.instant);
        let pm2_5 = reading.pollutants.pm2_5;

        if let Some(prev) = previous_idx {
            if idx != prev + 1 {
                record_gap(&mut report, city, prev + 1, idx);
                window.reset();
            }
        }
        previous_idx = Some(idx);
        window.push(pm2_5);

        let calendar = CalendarFeatures::from_instant(reading.instant);
        let mut values: Vec<Option<f64>> = Vec::with_capacity(schema.columns.len());
        values.extend(calendar.values().into_iter().map(Some));
        for column in &schema.columns[CALENDAR_COLUMNS.len()..] {
            let value = match column.kind {
                FeatureKind::Calendar => None,
                FeatureKind::Lag { hours } => by_hour.get(&(idx - hours as i64)).copied(),
                FeatureKind::RollingMean { hours } => window.mean(hours as usize),
                FeatureKind::RollingStd { hours } => window.std(hours as usize),
                FeatureKind::Diff { hours } => by_hour
                    .get(&(idx - hours as i64))
                    .map(|previous| pm2_5 - previous),
            };
            values.push(value);
        }

        let targets: Vec<Option<f64>> = (1..=cfg.horizon_hours as i64)
            .map(|h| by_hour.get(&(idx + h)).copied())
            .collect();

        let row = FeatureRow {
            city: city.to_string(),
            instant: reading.instant,
            pm2_5,
            calendar,
            values,
            targets,
            schema_fingerprint: schema.fingerprint.clone(),
        };
        if row.has_complete_features() {
            report.complete_rows += 1;
        }
        if row.is_trainable() {
            report.trainable_rows += 1;
        }
        rows.push(row);
    }

    report.output_rows = rows.len() as u64;

    info!(
        component = "features",
        event = "features.build.finish",
        city,
        input_points = report.input_points,
        dropped_future = report.dropped_future,
        output_rows = report.output_rows,
        complete_rows = report.complete_rows,
        trainable_rows = report.trainable_rows,
        missing_hours = report.missing_hours
    );

    Ok((schema, rows, report))
}

/// Rows usable for training: complete features and a complete target vector.
pub fn trainable_rows(rows: &[FeatureRow]) -> Vec<&FeatureRow> {
    rows.iter().filter(|row| row.is_trainable()).collect()
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn record_gap(report: &mut FeatureBuildReport, city: &str, start_idx: i64, end_idx_exclusive: i64) {
    let missing = (end_idx_exclusive - start_idx).max(0) as u64;
    report.missing_hours = report.missing_hours.saturating_add(missing);

    let start = instant_from_hour_index(start_idx).map(timestamp::format_instant);
    let end = instant_from_hour_index(end_idx_exclusive).map(timestamp::format_instant);
    warn!(
        component = "features",
        event = "features.build.gap_detected",
        city,
        start = ?start,
        end_exclusive = ?end,
        missing_hours = missing
    );

    if report.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
        if let (Some(start), Some(end)) = (start, end) {
            report.gap_ranges.push((start, end));
        }
    }
}

fn schema_fingerprint(
    cfg: &FeatureConfig,
    columns: &[FeatureColumn],
    target_columns: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("horizon_hours:{};", cfg.horizon_hours));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hasher.update(";targets:");
    for target in target_columns {
        hasher.update(target.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}
