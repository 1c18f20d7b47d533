use std::fs;
use std::path::Path;

use aqcast::{
    latest_forecast, load_model_artifact, run_feature_build, run_forecast, run_ingest,
    run_predict_at, run_train, AlignError, BaseRowPolicy, CsvReadingSource, DocumentStore,
    FeatureConfig, MemoryStore, ModelError, ModelRuntime, PipelineConfig, PipelineError,
    Pollutants, RawReadingBatch, Reading, ReadingSource, SourceError, TrainConfig,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::tempdir;

const HISTORY_HOURS: i64 = 200;
const FUTURE_HOURS: i64 = 5;

struct FixedSource {
    batch: RawReadingBatch,
}

impl ReadingSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    fn fetch_hourly(&self) -> Result<RawReadingBatch, SourceError> {
        Ok(self.batch.clone())
    }
}

fn now_hour() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0)
        .single()
        .expect("valid now")
}

fn pm25_at(hour: i64) -> f64 {
    let daily = (hour as f64 * std::f64::consts::TAU / 24.0).sin();
    45.0 + 15.0 * daily + (hour % 7) as f64
}

/// History up to and including `now_hour()` plus a few future hours, in
/// alternating timestamp encodings.
fn source_batch() -> RawReadingBatch {
    let first = now_hour() - Duration::hours(HISTORY_HOURS - 1);
    let mut batch = RawReadingBatch::default();
    for h in 0..HISTORY_HOURS + FUTURE_HOURS {
        let instant = first + Duration::hours(h);
        let raw = match h % 3 {
            0 => instant.format("%Y-%m-%dT%H:%M").to_string(),
            1 => instant.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            _ => (instant + Duration::hours(5))
                .format("%Y-%m-%dT%H:%M:%S+05:00")
                .to_string(),
        };
        batch.push(raw, Some(pm25_at(h)));
    }
    batch
}

fn pipeline_config(dir: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::new(dir.join("aqcast.sqlite"));
    cfg.features = FeatureConfig::with_horizon(3);
    cfg.model_path = dir.join("models").join("pm25_next3h.json");
    cfg
}

#[test]
fn ingest_build_train_forecast_and_predict() {
    let dir = tempdir().expect("tempdir");
    let cfg = pipeline_config(dir.path());
    let now = now_hour();
    let source = FixedSource {
        batch: source_batch(),
    };
    let mut store = MemoryStore::new();

    let ingest = run_ingest(&cfg, &source, &mut store, now).expect("ingest");
    assert_eq!(ingest.summary.accepted, HISTORY_HOURS as u64);
    assert_eq!(ingest.summary.skipped_future, FUTURE_HOURS as u64);
    assert_eq!(ingest.write.inserted, HISTORY_HOURS as u64);

    let features = run_feature_build(&cfg, &mut store, now).expect("feature build");
    assert_eq!(features.horizon_hours, 3);
    assert_eq!(features.build.output_rows, HISTORY_HOURS as u64);
    // Complete features from the 25th row; targets need three hours after.
    assert_eq!(features.build.complete_rows, 176);
    assert_eq!(features.build.trainable_rows, 173);

    let trained = run_train(&cfg, &store, &TrainConfig::for_horizon(3), now).expect("train");
    assert_eq!(trained.model_name, "linear_pm25_next3h");
    assert_eq!(trained.metrics.train_rows + trained.metrics.test_rows, 173);
    assert_eq!(trained.metrics.mae_per_horizon.len(), 3);
    assert!(trained.metrics.mae_all_horizons.is_finite());
    assert!(!cfg
        .model_path
        .with_file_name("pm25_next3h.json.tmp")
        .exists());

    let model = load_model_artifact(&cfg.model_path).expect("artifact loads");
    assert_eq!(model.horizon_hours(), 3);
    assert_eq!(model.schema_fingerprint(), features.schema_fingerprint);
    assert_eq!(
        model.artifact().trained_at.as_deref(),
        Some("2026-01-20T12:00:00Z")
    );
    assert!(model.artifact().metrics.is_some());

    let forecast = run_forecast(&cfg, &mut store, &model, now).expect("forecast");
    assert_eq!(forecast.base_time, now);
    assert_eq!(forecast.points, 3);
    assert_eq!(forecast.write.inserted, 3);

    let again = run_forecast(&cfg, &mut store, &model, now).expect("second forecast");
    assert_eq!(again.write.unchanged, 3);
    assert_eq!(again.write.inserted + again.write.updated, 0);

    let snapshot = latest_forecast(&store, "Karachi").expect("snapshot");
    assert_eq!(snapshot.rows.len(), 3);
    assert_eq!(snapshot.base_time, now);
    for (i, point) in snapshot.rows.iter().enumerate() {
        assert_eq!(point.horizon_hours, i as u32 + 1);
        assert_eq!(point.target_time, now + Duration::hours(i as i64 + 1));
        assert_eq!(point.created_at, now);
    }

    let query = now + Duration::hours(1) + Duration::minutes(30);
    let point = run_predict_at(&cfg, &store, &model, now, query).expect("predict at");
    assert_eq!(point.horizon_hours, 1);
    assert_eq!(point.base_time, now);
    assert_eq!(point.predicted_pm2_5, snapshot.rows[0].predicted_pm2_5);
    assert_eq!(point.aqi_category, snapshot.rows[0].aqi_category);

    let err = run_predict_at(&cfg, &store, &model, now, now + Duration::hours(4))
        .expect_err("beyond horizon");
    assert!(matches!(
        err,
        PipelineError::Align(AlignError::HorizonOutOfRange { delta_hours: 4, .. })
    ));

    let unchanged = latest_forecast(&store, "Karachi").expect("snapshot");
    assert_eq!(unchanged, snapshot);
}

#[test]
fn ingest_purges_previously_stored_future_readings() {
    let dir = tempdir().expect("tempdir");
    let cfg = pipeline_config(dir.path());
    let now = now_hour();
    let mut store = MemoryStore::new();

    let speculative: Vec<Reading> = (1..=4)
        .map(|h| Reading {
            city: "Karachi".to_string(),
            instant: now + Duration::hours(h),
            source: "forecast-leak".to_string(),
            pollutants: Pollutants::pm25_only(99.0),
        })
        .collect();
    store.upsert_readings(&speculative).expect("seed future");

    let source = FixedSource {
        batch: source_batch(),
    };
    let report = run_ingest(&cfg, &source, &mut store, now).expect("ingest");
    assert_eq!(report.purged_future, 4);

    let stored = store.readings_for_city("Karachi").expect("query");
    assert_eq!(stored.len(), HISTORY_HOURS as usize);
    assert!(stored.iter().all(|r| r.instant <= now));
}

#[test]
fn forecast_without_an_artifact_or_with_another_schema_fails() {
    let dir = tempdir().expect("tempdir");
    let cfg = pipeline_config(dir.path());
    let now = now_hour();
    let mut store = MemoryStore::new();

    let missing = load_model_artifact(&cfg.model_path).expect_err("nothing trained yet");
    assert!(matches!(missing, ModelError::ArtifactMissing(_)));

    let source = FixedSource {
        batch: source_batch(),
    };
    run_ingest(&cfg, &source, &mut store, now).expect("ingest");
    run_feature_build(&cfg, &mut store, now).expect("feature build");
    run_train(&cfg, &store, &TrainConfig::for_horizon(3), now).expect("train");
    let model = load_model_artifact(&cfg.model_path).expect("artifact loads");

    let mut other = cfg.clone();
    other.features = FeatureConfig::with_horizon(1);
    let err = run_forecast(&other, &mut store, &model, now).expect_err("schema differs");
    assert!(matches!(
        err,
        PipelineError::Model(ModelError::SchemaMismatch { .. })
    ));
    assert!(latest_forecast(&store, "Karachi").is_err());
}

#[test]
fn latest_complete_policy_recovers_from_a_missing_latest_hour() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = pipeline_config(dir.path());
    let now = now_hour();
    let mut store = MemoryStore::new();

    let mut batch = source_batch();
    // Drop the hour before now so the row at now has no 1h lag.
    let gap = (HISTORY_HOURS - 2) as usize;
    for series in [
        &mut batch.pm2_5,
        &mut batch.pm10,
        &mut batch.co,
        &mut batch.no2,
        &mut batch.so2,
        &mut batch.o3,
    ] {
        series.remove(gap);
    }
    batch.timestamps.remove(gap);

    let source = FixedSource { batch };
    run_ingest(&cfg, &source, &mut store, now).expect("ingest");
    run_feature_build(&cfg, &mut store, now).expect("feature build");
    run_train(&cfg, &store, &TrainConfig::for_horizon(3), now).expect("train");
    let model = load_model_artifact(&cfg.model_path).expect("artifact loads");

    let err = run_forecast(&cfg, &mut store, &model, now).expect_err("nearest row is incomplete");
    assert!(matches!(
        err,
        PipelineError::Align(AlignError::IncompleteBaseRow { .. })
    ));

    cfg.base_row_policy = BaseRowPolicy::LatestComplete { lookback: 48 };
    let report = run_forecast(&cfg, &mut store, &model, now).expect("falls back");
    assert!(report.base_time < now - Duration::hours(1));
    assert_eq!(report.points, 3);
}

#[test]
fn csv_source_feeds_the_same_ingest_path() {
    let dir = tempdir().expect("tempdir");
    let cfg = pipeline_config(dir.path());
    let now = now_hour();
    let csv_path = dir.path().join("karachi.csv");
    fs::write(
        &csv_path,
        "timestamp,pm2_5,pm10\n\
         2026-01-20T10:00,31.5,60\n\
         2026-01-20T11:00:00Z,,61\n\
         2026-01-20T16:30:00+05:00,33.0,\n\
         2026-01-20T13:00,34.0,63\n",
    )
    .expect("write csv");

    let source = CsvReadingSource::new(csv_path.clone());
    let mut store = MemoryStore::new();
    let report = run_ingest(&cfg, &source, &mut store, now).expect("ingest");
    assert_eq!(report.source, "csv");
    assert_eq!(report.summary.processed, 4);
    assert_eq!(report.summary.accepted, 2);
    assert_eq!(report.summary.skipped_future, 1);
    assert_eq!(report.summary.missing_pm2_5, 1);

    // 16:30+05:00 floors into the 11:00Z slot left empty by the null row.
    let stored = store.readings_for_city("Karachi").expect("query");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].instant, now - Duration::hours(1));
    assert_eq!(stored[1].pollutants.pm2_5, 33.0);
    assert_eq!(stored[1].pollutants.pm10, None);
}
