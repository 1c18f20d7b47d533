use aqcast::{
    build_feature_rows, build_feature_schema, materialize_forecast, run_forecast, DocumentStore,
    FeatureConfig, ForecastPoint, MemoryStore, ModelError, ModelRuntime, PipelineConfig,
    Pollutants, Reading, SqliteStore,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::tempdir;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 26, 12, 0, 0)
        .single()
        .expect("valid base")
}

fn forecast(base: DateTime<Utc>, values: &[f64]) -> Vec<ForecastPoint> {
    materialize_forecast("Karachi", base, values, values.len() as u32, base)
        .expect("forecast materializes")
}

fn readings(city: &str, hours: std::ops::Range<i64>) -> Vec<Reading> {
    hours
        .map(|h| Reading {
            city: city.to_string(),
            instant: base_time() + Duration::hours(h),
            source: "test".to_string(),
            pollutants: Pollutants::pm25_only(20.0 + h as f64),
        })
        .collect()
}

#[test]
fn rematerializing_the_same_run_is_unchanged() {
    let dir = tempdir().expect("tempdir");
    let mut store = SqliteStore::open(&dir.path().join("aqcast.sqlite")).expect("open store");

    let points = forecast(base_time(), &[10.0, 20.0, 30.0]);
    let first = store.upsert_forecast_points(&points).expect("first upsert");
    assert_eq!(first.inserted, 3);
    assert!(first.is_clean());

    let second = store.upsert_forecast_points(&points).expect("second upsert");
    assert_eq!(second.processed, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 3);

    let revised = forecast(base_time(), &[10.0, 25.0, 30.0]);
    let third = store.upsert_forecast_points(&revised).expect("third upsert");
    assert_eq!(third.updated, 1);
    assert_eq!(third.unchanged, 2);
}

struct FlatRuntime {
    fingerprint: String,
    horizon_hours: u32,
}

impl ModelRuntime for FlatRuntime {
    fn horizon_hours(&self) -> u32 {
        self.horizon_hours
    }

    fn schema_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn predict(&self, _features: &[f64]) -> Result<Vec<f64>, ModelError> {
        Ok(vec![42.5; self.horizon_hours as usize])
    }
}

#[test]
fn forecast_rerun_in_a_later_hour_keeps_documents_identical() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = PipelineConfig::new(dir.path().join("aqcast.sqlite"));
    cfg.features = FeatureConfig::with_horizon(3);
    let now = base_time() + Duration::hours(39);

    let mut sqlite = SqliteStore::open(&cfg.store_path).expect("open store");
    let mut memory = MemoryStore::new();
    let stores: [&mut dyn DocumentStore; 2] = [&mut sqlite, &mut memory];

    for store in stores {
        let series = readings("Karachi", 0..40);
        let (_, rows, _) =
            build_feature_rows("Karachi", &series, &cfg.features, now).expect("build succeeds");
        store.upsert_feature_rows(&rows).expect("upsert rows");
        let model = FlatRuntime {
            fingerprint: build_feature_schema(&cfg.features).fingerprint,
            horizon_hours: 3,
        };

        let first = run_forecast(&cfg, store, &model, now).expect("first run");
        assert_eq!(first.write.inserted, 3);

        let later =
            run_forecast(&cfg, store, &model, now + Duration::hours(1)).expect("later run");
        assert_eq!(later.base_time, first.base_time);
        assert_eq!(later.write.unchanged, 3);
        assert_eq!(later.write.inserted + later.write.updated, 0);

        let snapshot = store
            .latest_forecast("Karachi")
            .expect("query")
            .expect("forecast exists");
        assert!(snapshot.rows.iter().all(|p| p.created_at == now));

        let mut revised = snapshot.rows.clone();
        for point in &mut revised {
            point.predicted_pm2_5 += 1.0;
            point.created_at = now + Duration::hours(2);
        }
        let report = store.upsert_forecast_points(&revised).expect("revise");
        assert_eq!(report.updated, 3);
        let snapshot = store
            .latest_forecast("Karachi")
            .expect("query")
            .expect("forecast exists");
        assert_eq!(snapshot.rows[0].predicted_pm2_5, 43.5);
        assert!(snapshot.rows.iter().all(|p| p.created_at == now));
    }
}

#[test]
fn latest_forecast_is_the_newest_base_time_sorted_by_horizon() {
    let dir = tempdir().expect("tempdir");
    let mut store = SqliteStore::open(&dir.path().join("aqcast.sqlite")).expect("open store");

    let older = forecast(base_time(), &[1.0, 2.0, 3.0]);
    let mut newer = forecast(base_time() + Duration::hours(1), &[4.0, 5.0, 6.0]);
    newer.reverse();

    store.upsert_forecast_points(&newer).expect("upsert newer");
    store.upsert_forecast_points(&older).expect("upsert older");

    let snapshot = store
        .latest_forecast("Karachi")
        .expect("query")
        .expect("forecast exists");
    assert_eq!(snapshot.base_time, base_time() + Duration::hours(1));
    let horizons: Vec<u32> = snapshot.rows.iter().map(|p| p.horizon_hours).collect();
    assert_eq!(horizons, vec![1, 2, 3]);
    assert_eq!(snapshot.rows[0].predicted_pm2_5, 4.0);

    assert!(store.latest_forecast("Lahore").expect("query").is_none());
}

#[test]
fn invalid_items_fail_individually() {
    let mut store = SqliteStore::open_in_memory().expect("open store");
    let mut points = forecast(base_time(), &[10.0, 20.0, 30.0]);
    points[1].city = "  ".to_string();

    let report = store.upsert_forecast_points(&points).expect("batch completes");
    assert_eq!(report.processed, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].index, 1);
    assert!(report.failures[0].message.contains("city"));
}

#[test]
fn feature_rows_at_or_before_is_newest_first_and_limited() {
    let cfg = FeatureConfig::with_horizon(1);
    let series = readings("Karachi", 0..40);
    let ceiling = base_time() + Duration::hours(39);
    let (_, rows, _) =
        build_feature_rows("Karachi", &series, &cfg, ceiling).expect("build succeeds");

    let mut sqlite = SqliteStore::open_in_memory().expect("open store");
    let mut memory = MemoryStore::new();
    let stores: [&mut dyn DocumentStore; 2] = [&mut sqlite, &mut memory];

    for store in stores {
        let report = store.upsert_feature_rows(&rows).expect("upsert rows");
        assert_eq!(report.inserted, 40);

        let ceiling = base_time() + Duration::hours(35) + Duration::minutes(20);
        let recent = store
            .feature_rows_at_or_before("Karachi", ceiling, 3)
            .expect("query");
        let instants: Vec<DateTime<Utc>> = recent.iter().map(|r| r.instant).collect();
        assert_eq!(
            instants,
            vec![
                base_time() + Duration::hours(35),
                base_time() + Duration::hours(34),
                base_time() + Duration::hours(33),
            ]
        );
        assert_eq!(recent[0], rows[35]);

        let all = store.feature_rows_for_city("Karachi").expect("query");
        assert_eq!(all, rows);
        assert!(store
            .feature_rows_at_or_before("Karachi", base_time() - Duration::hours(1), 10)
            .expect("query")
            .is_empty());
    }
}

#[test]
fn purge_removes_only_the_city_future() {
    let mut sqlite = SqliteStore::open_in_memory().expect("open store");
    let mut memory = MemoryStore::new();
    let stores: [&mut dyn DocumentStore; 2] = [&mut sqlite, &mut memory];

    for store in stores {
        store
            .upsert_readings(&readings("Karachi", 0..10))
            .expect("upsert karachi");
        store
            .upsert_readings(&readings("Lahore", 0..10))
            .expect("upsert lahore");

        let purged = store
            .purge_readings_after("Karachi", base_time() + Duration::hours(6))
            .expect("purge");
        assert_eq!(purged, 3);
        assert_eq!(store.readings_for_city("Karachi").expect("query").len(), 7);
        assert_eq!(store.readings_for_city("Lahore").expect("query").len(), 10);
    }
}

#[test]
fn sqlite_documents_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("aqcast.sqlite");
    let points = forecast(base_time(), &[12.0, 55.5]);

    {
        let mut store = SqliteStore::open(&path).expect("open store");
        store
            .upsert_readings(&readings("Karachi", 0..5))
            .expect("upsert readings");
        store.upsert_forecast_points(&points).expect("upsert points");
    }

    let store = SqliteStore::open(&path).expect("reopen store");
    let stored = store.readings_for_city("Karachi").expect("query");
    assert_eq!(stored, readings("Karachi", 0..5));
    let snapshot = store
        .latest_forecast("Karachi")
        .expect("query")
        .expect("forecast exists");
    assert_eq!(snapshot.rows, points);
}
