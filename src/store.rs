//! Document persistence for readings, feature rows and forecast points.
//!
//! Every collection is keyed by a composite key and written with
//! upsert-by-key. Bulk writes report per-item failures instead of
//! aborting the batch.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Statement};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::features::FeatureRow;
use crate::forecast::{ForecastPoint, ForecastSnapshot};
use crate::readings::Reading;
use crate::timestamp::format_instant;

const MAX_REPORTED_FAILURES: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored {collection} document {key} could not be decoded: {message}")]
    Decode {
        collection: &'static str,
        key: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteReport {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Upserts whose stored document was already identical.
    pub unchanged: u64,
    pub failed: u64,
    pub failures: Vec<ItemFailure>,
}

impl BulkWriteReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, index: usize, key: String, outcome: Result<WriteOutcome, String>) {
        self.processed += 1;
        match outcome {
            Ok(WriteOutcome::Inserted) => self.inserted += 1,
            Ok(WriteOutcome::Updated) => self.updated += 1,
            Ok(WriteOutcome::Unchanged) => self.unchanged += 1,
            Err(message) => {
                self.failed += 1;
                warn!(
                    component = "store",
                    event = "store.upsert.item_failed",
                    index,
                    key = %key,
                    error = %message
                );
                if self.failures.len() < MAX_REPORTED_FAILURES {
                    self.failures.push(ItemFailure {
                        index,
                        key,
                        message,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Upsert-by-key, sorted range reads, and "latest at or before" lookups.
pub trait DocumentStore {
    fn upsert_readings(&mut self, readings: &[Reading]) -> Result<BulkWriteReport, StoreError>;

    /// Ascending by instant.
    fn readings_for_city(&self, city: &str) -> Result<Vec<Reading>, StoreError>;

    /// Deletes readings strictly after `ceiling`; returns the count removed.
    fn purge_readings_after(
        &mut self,
        city: &str,
        ceiling: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    fn upsert_feature_rows(&mut self, rows: &[FeatureRow]) -> Result<BulkWriteReport, StoreError>;

    /// Ascending by instant.
    fn feature_rows_for_city(&self, city: &str) -> Result<Vec<FeatureRow>, StoreError>;

    /// Up to `limit` rows with instant at or before `ceiling`, newest first.
    fn feature_rows_at_or_before(
        &self,
        city: &str,
        ceiling: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeatureRow>, StoreError>;

    fn upsert_forecast_points(
        &mut self,
        points: &[ForecastPoint],
    ) -> Result<BulkWriteReport, StoreError>;

    /// Points of the greatest base_time for `city`, ascending by horizon.
    fn latest_forecast(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError>;
}

fn check_reading(reading: &Reading) -> Result<(), String> {
    check_city(&reading.city)?;
    if !reading.pollutants.pm2_5.is_finite() {
        return Err(format!("pm2_5 is not finite ({})", reading.pollutants.pm2_5));
    }
    Ok(())
}

fn check_feature_row(row: &FeatureRow) -> Result<(), String> {
    check_city(&row.city)?;
    if !row.pm2_5.is_finite() {
        return Err(format!("pm2_5 is not finite ({})", row.pm2_5));
    }
    Ok(())
}

fn check_forecast_point(point: &ForecastPoint) -> Result<(), String> {
    check_city(&point.city)?;
    if point.horizon_hours == 0 {
        return Err("horizon_hours must be >= 1".to_string());
    }
    if !point.predicted_pm2_5.is_finite() {
        return Err(format!(
            "predicted_pm2_5 is not finite ({})",
            point.predicted_pm2_5
        ));
    }
    Ok(())
}

fn check_city(city: &str) -> Result<(), String> {
    if city.trim().is_empty() {
        return Err("city must not be empty".to_string());
    }
    Ok(())
}

fn reading_key(reading: &Reading) -> String {
    format!("{}@{}", reading.city, format_instant(reading.instant))
}

fn feature_key(row: &FeatureRow) -> String {
    format!("{}@{}", row.city, format_instant(row.instant))
}

fn forecast_key(point: &ForecastPoint) -> String {
    format!(
        "{}@{}+{}h",
        point.city,
        format_instant(point.base_time),
        point.horizon_hours
    )
}

fn log_bulk(collection: &'static str, report: &BulkWriteReport) {
    info!(
        component = "store",
        event = "store.upsert.finish",
        collection,
        processed = report.processed,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed
    );
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        debug!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    fn decode_docs<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let doc: String = row.get(1)?;
            let value = serde_json::from_str(&doc).map_err(|err| StoreError::Decode {
                collection,
                key,
                message: err.to_string(),
            })?;
            out.push(value);
        }
        Ok(out)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS readings (
            city TEXT NOT NULL,
            ts TEXT NOT NULL,
            doc TEXT NOT NULL,
            PRIMARY KEY(city, ts)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS feature_rows (
            city TEXT NOT NULL,
            ts TEXT NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            complete INTEGER NOT NULL,
            doc TEXT NOT NULL,
            PRIMARY KEY(city, ts)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS forecasts (
            city TEXT NOT NULL,
            base_time TEXT NOT NULL,
            horizon_hours INTEGER NOT NULL,
            target_time TEXT NOT NULL,
            doc TEXT NOT NULL,
            PRIMARY KEY(city, base_time, horizon_hours)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

/// `exists` binds `keys`; `upsert` binds `keys`, then `extra`, then the document.
/// `doc` renders the new document given the stored one, if any.
fn upsert_one(
    exists: &mut Statement<'_>,
    upsert: &mut Statement<'_>,
    keys: &[&dyn ToSql],
    extra: &[&dyn ToSql],
    doc: impl FnOnce(Option<&str>) -> Result<String, String>,
) -> Result<WriteOutcome, String> {
    let existing: Option<String> = exists
        .query_row(keys, |row| row.get(0))
        .optional()
        .map_err(|err| err.to_string())?;
    let doc = doc(existing.as_deref())?;

    let outcome = match existing.as_deref() {
        None => WriteOutcome::Inserted,
        Some(current) if current == doc => return Ok(WriteOutcome::Unchanged),
        Some(_) => WriteOutcome::Updated,
    };

    let mut bound: Vec<&dyn ToSql> = keys.to_vec();
    bound.extend_from_slice(extra);
    bound.push(&doc);
    upsert
        .execute(bound.as_slice())
        .map_err(|err| err.to_string())?;
    Ok(outcome)
}

fn to_doc<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|err| err.to_string())
}

/// `created_at` is set on insert only.
fn with_stored_created_at(
    point: &ForecastPoint,
    stored: Option<&ForecastPoint>,
) -> ForecastPoint {
    match stored {
        Some(stored) => ForecastPoint {
            created_at: stored.created_at,
            ..point.clone()
        },
        None => point.clone(),
    }
}

fn forecast_doc(point: &ForecastPoint, existing: Option<&str>) -> Result<String, String> {
    let stored: Option<ForecastPoint> = existing
        .map(serde_json::from_str::<ForecastPoint>)
        .transpose()
        .map_err(|err| err.to_string())?;
    to_doc(&with_stored_created_at(point, stored.as_ref()))
}

impl DocumentStore for SqliteStore {
    fn upsert_readings(&mut self, readings: &[Reading]) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut exists = tx.prepare("SELECT doc FROM readings WHERE city = ?1 AND ts = ?2")?;
            let mut upsert = tx.prepare(
                "
                INSERT INTO readings (city, ts, doc) VALUES (?1, ?2, ?3)
                ON CONFLICT(city, ts) DO UPDATE SET doc = excluded.doc
                ",
            )?;

            for (index, reading) in readings.iter().enumerate() {
                let outcome = check_reading(reading).and_then(|()| {
                    let ts = format_instant(reading.instant);
                    upsert_one(&mut exists, &mut upsert, &[&reading.city, &ts], &[], |_| {
                        to_doc(reading)
                    })
                });
                report.record(index, reading_key(reading), outcome);
            }
        }
        tx.commit()?;

        log_bulk("readings", &report);
        Ok(report)
    }

    fn readings_for_city(&self, city: &str) -> Result<Vec<Reading>, StoreError> {
        self.decode_docs(
            "readings",
            "SELECT ts, doc FROM readings WHERE city = ?1 ORDER BY ts ASC",
            &[&city],
        )
    }

    fn purge_readings_after(
        &mut self,
        city: &str,
        ceiling: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM readings WHERE city = ?1 AND ts > ?2",
            params![city, format_instant(ceiling)],
        )?;
        info!(
            component = "store",
            event = "store.purge_future.finish",
            city,
            ceiling = %format_instant(ceiling),
            deleted
        );
        Ok(deleted as u64)
    }

    fn upsert_feature_rows(&mut self, rows: &[FeatureRow]) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut exists =
                tx.prepare("SELECT doc FROM feature_rows WHERE city = ?1 AND ts = ?2")?;
            let mut upsert = tx.prepare(
                "
                INSERT INTO feature_rows (city, ts, schema_fingerprint, complete, doc)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(city, ts) DO UPDATE SET
                    schema_fingerprint = excluded.schema_fingerprint,
                    complete = excluded.complete,
                    doc = excluded.doc
                ",
            )?;

            for (index, row) in rows.iter().enumerate() {
                let outcome = check_feature_row(row).and_then(|()| {
                    let ts = format_instant(row.instant);
                    let complete = row.has_complete_features();
                    upsert_one(
                        &mut exists,
                        &mut upsert,
                        &[&row.city, &ts],
                        &[&row.schema_fingerprint, &complete],
                        |_| to_doc(row),
                    )
                });
                report.record(index, feature_key(row), outcome);
            }
        }
        tx.commit()?;

        log_bulk("feature_rows", &report);
        Ok(report)
    }

    fn feature_rows_for_city(&self, city: &str) -> Result<Vec<FeatureRow>, StoreError> {
        self.decode_docs(
            "feature_rows",
            "SELECT ts, doc FROM feature_rows WHERE city = ?1 ORDER BY ts ASC",
            &[&city],
        )
    }

    fn feature_rows_at_or_before(
        &self,
        city: &str,
        ceiling: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeatureRow>, StoreError> {
        let ceiling = format_instant(ceiling);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.decode_docs(
            "feature_rows",
            "
            SELECT ts, doc FROM feature_rows
            WHERE city = ?1 AND ts <= ?2
            ORDER BY ts DESC
            LIMIT ?3
            ",
            &[&city, &ceiling, &limit],
        )
    }

    fn upsert_forecast_points(
        &mut self,
        points: &[ForecastPoint],
    ) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut exists = tx.prepare(
                "SELECT doc FROM forecasts WHERE city = ?1 AND base_time = ?2 AND horizon_hours = ?3",
            )?;
            let mut upsert = tx.prepare(
                "
                INSERT INTO forecasts (city, base_time, horizon_hours, target_time, doc)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(city, base_time, horizon_hours) DO UPDATE SET
                    target_time = excluded.target_time,
                    doc = excluded.doc
                ",
            )?;

            for (index, point) in points.iter().enumerate() {
                let outcome = check_forecast_point(point).and_then(|()| {
                    let base_time = format_instant(point.base_time);
                    let target_time = format_instant(point.target_time);
                    upsert_one(
                        &mut exists,
                        &mut upsert,
                        &[&point.city, &base_time, &point.horizon_hours],
                        &[&target_time],
                        |existing| forecast_doc(point, existing),
                    )
                });
                report.record(index, forecast_key(point), outcome);
            }
        }
        tx.commit()?;

        log_bulk("forecasts", &report);
        Ok(report)
    }

    fn latest_forecast(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(base_time) FROM forecasts WHERE city = ?1",
            params![city],
            |row| row.get(0),
        )?;
        let Some(base_time) = latest else {
            return Ok(None);
        };

        let rows: Vec<ForecastPoint> = self.decode_docs(
            "forecasts",
            "
            SELECT base_time || '+' || horizon_hours, doc FROM forecasts
            WHERE city = ?1 AND base_time = ?2
            ORDER BY horizon_hours ASC
            ",
            &[&city, &base_time],
        )?;
        Ok(snapshot_from_points(city, rows))
    }
}

fn snapshot_from_points(city: &str, rows: Vec<ForecastPoint>) -> Option<ForecastSnapshot> {
    let base_time = rows.first()?.base_time;
    Some(ForecastSnapshot {
        city: city.to_string(),
        base_time,
        rows,
    })
}

/// BTreeMap-backed store with the same key and ordering semantics as
/// [`SqliteStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    readings: BTreeMap<(String, DateTime<Utc>), Reading>,
    feature_rows: BTreeMap<(String, DateTime<Utc>), FeatureRow>,
    forecasts: BTreeMap<(String, DateTime<Utc>, u32), ForecastPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn memory_upsert<K: Ord, V: Clone + PartialEq>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: &V,
) -> WriteOutcome {
    match map.insert(key, value.clone()) {
        None => WriteOutcome::Inserted,
        Some(previous) if previous == *value => WriteOutcome::Unchanged,
        Some(_) => WriteOutcome::Updated,
    }
}

impl DocumentStore for MemoryStore {
    fn upsert_readings(&mut self, readings: &[Reading]) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        for (index, reading) in readings.iter().enumerate() {
            let outcome = check_reading(reading).map(|()| {
                memory_upsert(
                    &mut self.readings,
                    (reading.city.clone(), reading.instant),
                    reading,
                )
            });
            report.record(index, reading_key(reading), outcome);
        }
        log_bulk("readings", &report);
        Ok(report)
    }

    fn readings_for_city(&self, city: &str) -> Result<Vec<Reading>, StoreError> {
        Ok(self
            .readings
            .iter()
            .filter(|((c, _), _)| c == city)
            .map(|(_, reading)| reading.clone())
            .collect())
    }

    fn purge_readings_after(
        &mut self,
        city: &str,
        ceiling: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let before = self.readings.len();
        self.readings
            .retain(|(c, instant), _| c != city || *instant <= ceiling);
        Ok((before - self.readings.len()) as u64)
    }

    fn upsert_feature_rows(&mut self, rows: &[FeatureRow]) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        for (index, row) in rows.iter().enumerate() {
            let outcome = check_feature_row(row).map(|()| {
                memory_upsert(&mut self.feature_rows, (row.city.clone(), row.instant), row)
            });
            report.record(index, feature_key(row), outcome);
        }
        log_bulk("feature_rows", &report);
        Ok(report)
    }

    fn feature_rows_for_city(&self, city: &str) -> Result<Vec<FeatureRow>, StoreError> {
        Ok(self
            .feature_rows
            .iter()
            .filter(|((c, _), _)| c == city)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn feature_rows_at_or_before(
        &self,
        city: &str,
        ceiling: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeatureRow>, StoreError> {
        Ok(self
            .feature_rows
            .iter()
            .rev()
            .filter(|((c, instant), _)| c == city && *instant <= ceiling)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn upsert_forecast_points(
        &mut self,
        points: &[ForecastPoint],
    ) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        for (index, point) in points.iter().enumerate() {
            let outcome = check_forecast_point(point).map(|()| {
                let key = (point.city.clone(), point.base_time, point.horizon_hours);
                let point = with_stored_created_at(point, self.forecasts.get(&key));
                memory_upsert(&mut self.forecasts, key, &point)
            });
            report.record(index, forecast_key(point), outcome);
        }
        log_bulk("forecasts", &report);
        Ok(report)
    }

    fn latest_forecast(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError> {
        let latest = self
            .forecasts
            .keys()
            .filter(|(c, _, _)| c == city)
            .map(|(_, base_time, _)| *base_time)
            .max();
        let Some(base_time) = latest else {
            return Ok(None);
        };

        let rows: Vec<ForecastPoint> = self
            .forecasts
            .iter()
            .filter(|((c, b, _), _)| c == city && *b == base_time)
            .map(|(_, point)| point.clone())
            .collect();
        Ok(snapshot_from_points(city, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::Pollutants;
    use chrono::TimeZone;

    fn reading(city: &str, hour: u32, pm2_5: f64) -> Reading {
        Reading {
            city: city.to_string(),
            instant: Utc.with_ymd_and_hms(2026, 1, 26, hour, 0, 0).unwrap(),
            source: "test".to_string(),
            pollutants: Pollutants::pm25_only(pm2_5),
        }
    }

    fn exercise_reading_semantics(store: &mut dyn DocumentStore) {
        let report = store
            .upsert_readings(&[
                reading("Karachi", 2, 10.0),
                reading("Karachi", 1, 11.0),
                reading("", 3, 12.0),
                reading("Lahore", 1, 99.0),
            ])
            .unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].index, 2);

        let report = store
            .upsert_readings(&[reading("Karachi", 1, 11.0), reading("Karachi", 2, 20.0)])
            .unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.updated, 1);

        let rows = store.readings_for_city("Karachi").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].instant < rows[1].instant);
        assert_eq!(rows[1].pollutants.pm2_5, 20.0);

        let ceiling = Utc.with_ymd_and_hms(2026, 1, 26, 1, 0, 0).unwrap();
        assert_eq!(store.purge_readings_after("Karachi", ceiling).unwrap(), 1);
        assert_eq!(store.readings_for_city("Karachi").unwrap().len(), 1);
        assert_eq!(store.readings_for_city("Lahore").unwrap().len(), 1);
    }

    #[test]
    fn sqlite_store_upserts_and_purges() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        exercise_reading_semantics(&mut store);
    }

    #[test]
    fn memory_store_upserts_and_purges() {
        let mut store = MemoryStore::new();
        exercise_reading_semantics(&mut store);
    }
}
