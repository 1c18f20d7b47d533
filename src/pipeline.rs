//! Batch jobs: ingest, feature build, train, forecast, on-demand predict.
//!
//! Each job takes the run's `now_hour` from the caller so every stage of
//! one run applies the same no-future ceiling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::aqi::AqiCategory;
use crate::config::{ConfigError, PipelineConfig};
use crate::features::{
    build_feature_rows, build_feature_schema, FeatureBuildReport, FeatureError, FeatureRow,
    FeatureSchema,
};
use crate::forecast::{
    forecast_point, materialize_forecast, ForecastError, ForecastPoint, ForecastSnapshot,
};
use crate::horizon::{align_horizon, select_base_row, AlignError, BaseRowPolicy};
use crate::model::{
    ensure_runtime_compatible, save_model_artifact, train_linear_model, ModelError,
    ModelRuntime, TrainConfig, TrainingMetrics,
};
use crate::readings::{normalize_batch, IngestSummary};
use crate::source::{ReadingSource, SourceError};
use crate::store::{BulkWriteReport, DocumentStore, StoreError};
use crate::timestamp;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Align(#[from] AlignError),
    #[error(transparent)]
    Forecast(#[from] ForecastError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no forecast stored for city '{city}'")]
    NoForecast { city: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub city: String,
    pub source: String,
    #[serde(with = "timestamp::canonical")]
    pub now_hour: DateTime<Utc>,
    pub purged_future: u64,
    pub summary: IngestSummary,
    pub write: BulkWriteReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureJobReport {
    pub city: String,
    #[serde(with = "timestamp::canonical")]
    pub now_hour: DateTime<Utc>,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub horizon_hours: u32,
    pub build: FeatureBuildReport,
    pub write: BulkWriteReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub city: String,
    pub model_name: String,
    pub model_path: String,
    pub schema_fingerprint: String,
    pub horizon_hours: u32,
    pub metrics: TrainingMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastJobReport {
    pub city: String,
    #[serde(with = "timestamp::canonical")]
    pub base_time: DateTime<Utc>,
    #[serde(with = "timestamp::canonical")]
    pub now_hour: DateTime<Utc>,
    pub horizon_hours: u32,
    pub points: usize,
    pub peak: Option<ForecastPoint>,
    pub write: BulkWriteReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPrediction {
    pub city: String,
    #[serde(with = "timestamp::canonical")]
    pub base_time: DateTime<Utc>,
    pub query_instant: String,
    pub horizon_hours: u32,
    #[serde(with = "timestamp::canonical")]
    pub target_time: DateTime<Utc>,
    pub predicted_pm2_5: f64,
    pub aqi_index: Option<u16>,
    pub aqi_category: AqiCategory,
}

/// Purges speculative readings after `now_hour`, then fetches, normalizes
/// and upserts the source's current batch.
pub fn run_ingest(
    cfg: &PipelineConfig,
    source: &dyn ReadingSource,
    store: &mut dyn DocumentStore,
    now_hour: DateTime<Utc>,
) -> Result<IngestReport, PipelineError> {
    let city = cfg.city.name.as_str();
    let purged_future = store.purge_readings_after(city, now_hour)?;

    let batch = source.fetch_hourly()?;
    let normalized = normalize_batch(city, source.name(), &batch, now_hour)?;
    let write = store.upsert_readings(&normalized.readings)?;

    info!(
        component = "pipeline",
        event = "pipeline.ingest.finish",
        city,
        source = source.name(),
        purged_future,
        accepted = normalized.summary.accepted,
        inserted = write.inserted,
        updated = write.updated,
        failed = write.failed
    );

    Ok(IngestReport {
        city: city.to_string(),
        source: source.name().to_string(),
        now_hour,
        purged_future,
        summary: normalized.summary,
        write,
    })
}

pub fn run_feature_build(
    cfg: &PipelineConfig,
    store: &mut dyn DocumentStore,
    now_hour: DateTime<Utc>,
) -> Result<FeatureJobReport, PipelineError> {
    let city = cfg.city.name.as_str();
    let readings = store.readings_for_city(city)?;
    let (schema, rows, build) = build_feature_rows(city, &readings, &cfg.features, now_hour)?;
    let write = store.upsert_feature_rows(&rows)?;

    Ok(FeatureJobReport {
        city: city.to_string(),
        now_hour,
        schema_version: schema.version,
        schema_fingerprint: schema.fingerprint,
        horizon_hours: schema.horizon_hours,
        build,
        write,
    })
}

/// Fits the linear runtime on stored trainable rows and writes the artifact
/// to `cfg.model_path`.
pub fn run_train(
    cfg: &PipelineConfig,
    store: &dyn DocumentStore,
    train_cfg: &TrainConfig,
    now_hour: DateTime<Utc>,
) -> Result<TrainReport, PipelineError> {
    let city = cfg.city.name.as_str();
    let schema = build_feature_schema(&cfg.features);
    let rows: Vec<FeatureRow> = store
        .feature_rows_for_city(city)?
        .into_iter()
        .filter(|row| row.instant <= now_hour && row.is_trainable())
        .collect();

    let (model, metrics) = train_linear_model(&schema, &rows, train_cfg)?;
    let mut artifact = model.into_artifact();
    artifact.trained_at = Some(timestamp::format_instant(now_hour));
    artifact.metrics = Some(metrics.clone());
    save_model_artifact(&cfg.model_path, &artifact)?;

    Ok(TrainReport {
        city: city.to_string(),
        model_name: artifact.model_name,
        model_path: cfg.model_path.display().to_string(),
        schema_fingerprint: artifact.schema_fingerprint,
        horizon_hours: artifact.horizon_hours,
        metrics,
    })
}

/// Predicts from the base row and upserts one point per horizon.
pub fn run_forecast(
    cfg: &PipelineConfig,
    store: &mut dyn DocumentStore,
    model: &dyn ModelRuntime,
    now_hour: DateTime<Utc>,
) -> Result<ForecastJobReport, PipelineError> {
    let city = cfg.city.name.as_str();
    let schema = build_feature_schema(&cfg.features);
    ensure_runtime_compatible(model, &schema)?;

    let (base, features) = resolve_base_row(cfg, store, &schema, now_hour)?;
    let predictions = model.predict(&features)?;
    let points = materialize_forecast(
        city,
        base.instant,
        &predictions,
        schema.horizon_hours,
        now_hour,
    )?;
    let write = store.upsert_forecast_points(&points)?;

    let peak = points
        .iter()
        .max_by(|a, b| a.predicted_pm2_5.total_cmp(&b.predicted_pm2_5))
        .cloned();

    info!(
        component = "pipeline",
        event = "pipeline.forecast.finish",
        city,
        base_time = %timestamp::format_instant(base.instant),
        points = points.len(),
        inserted = write.inserted,
        updated = write.updated,
        unchanged = write.unchanged,
        failed = write.failed
    );

    Ok(ForecastJobReport {
        city: city.to_string(),
        base_time: base.instant,
        now_hour,
        horizon_hours: schema.horizon_hours,
        points: points.len(),
        peak,
        write,
    })
}

/// Prediction for one arbitrary instant; nothing is persisted.
pub fn run_predict_at(
    cfg: &PipelineConfig,
    store: &dyn DocumentStore,
    model: &dyn ModelRuntime,
    now_hour: DateTime<Utc>,
    query_instant: DateTime<Utc>,
) -> Result<PointPrediction, PipelineError> {
    let city = cfg.city.name.as_str();
    let schema = build_feature_schema(&cfg.features);
    ensure_runtime_compatible(model, &schema)?;

    let (base, features) = resolve_base_row(cfg, store, &schema, now_hour)?;
    let alignment = align_horizon(base.instant, query_instant, schema.horizon_hours)?;
    let predictions = model.predict(&features)?;
    let value = alignment.select(&predictions, schema.horizon_hours)?;
    let point = forecast_point(city, base.instant, alignment.horizon_hours, value, now_hour);

    info!(
        component = "pipeline",
        event = "pipeline.predict_at.finish",
        city,
        base_time = %timestamp::format_instant(base.instant),
        query_instant = %query_instant.to_rfc3339(),
        horizon_hours = alignment.horizon_hours,
        predicted_pm2_5 = point.predicted_pm2_5,
        aqi_category = %point.aqi_category
    );

    Ok(PointPrediction {
        city: point.city,
        base_time: point.base_time,
        query_instant: query_instant.to_rfc3339(),
        horizon_hours: point.horizon_hours,
        target_time: point.target_time,
        predicted_pm2_5: point.predicted_pm2_5,
        aqi_index: point.aqi_index,
        aqi_category: point.aqi_category,
    })
}

pub fn latest_forecast(
    store: &dyn DocumentStore,
    city: &str,
) -> Result<ForecastSnapshot, PipelineError> {
    store
        .latest_forecast(city)?
        .ok_or_else(|| PipelineError::NoForecast {
            city: city.to_string(),
        })
}

fn resolve_base_row(
    cfg: &PipelineConfig,
    store: &dyn DocumentStore,
    schema: &FeatureSchema,
    now_hour: DateTime<Utc>,
) -> Result<(FeatureRow, Vec<f64>), PipelineError> {
    let city = cfg.city.name.as_str();
    let limit = match cfg.base_row_policy {
        BaseRowPolicy::Nearest => 1,
        BaseRowPolicy::LatestComplete { lookback } => lookback.max(1),
    };
    let candidates = store.feature_rows_at_or_before(city, now_hour, limit)?;
    let base = select_base_row(city, &candidates, schema, now_hour, cfg.base_row_policy)?;

    if base.schema_fingerprint != schema.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: schema.fingerprint.clone(),
            actual: base.schema_fingerprint.clone(),
        }
        .into());
    }

    let features = base
        .feature_vector()
        .ok_or_else(|| AlignError::IncompleteBaseRow {
            base_time: base.instant,
            missing_features: base.missing_feature_names(schema),
            policy: cfg.base_row_policy,
            scanned: candidates.len(),
        })?;
    Ok((base.clone(), features))
}
