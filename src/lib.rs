//! Hourly PM2.5 forecasting engine.
//!
//! Readings flow through timestamp normalization into an ordered series,
//! become leakage-free feature rows with multi-step-ahead targets, and are
//! turned into per-horizon forecast points with US AQI categories.

mod aqi;
mod config;
mod features;
mod forecast;
mod horizon;
mod model;
mod observability;
mod pipeline;
mod readings;
mod server;
mod source;
mod store;
mod timestamp;

pub use aqi::{
    aqi_for_pm25, AqiBand, AqiCategory, AqiReading, MAX_PM25_CONCENTRATION, PM25_BREAKPOINTS,
};
pub use config::{
    default_model_path, pipeline_config_from_env, pipeline_config_from_lookup,
    target_time_from_env, target_time_from_lookup, CityConfig, ConfigError, PipelineConfig,
    SourceConfig, DEFAULT_OPEN_METEO_URL,
};
pub use features::{
    assert_schema_compatible, build_feature_rows, build_feature_schema, trainable_rows,
    CalendarFeatures, FeatureBuildReport, FeatureColumn, FeatureConfig, FeatureError, FeatureKind,
    FeatureRow, FeatureSchema, FEATURE_SCHEMA_VERSION, MAX_HORIZON_HOURS,
};
pub use forecast::{
    forecast_point, materialize_forecast, ForecastError, ForecastPoint, ForecastSnapshot,
};
pub use horizon::{
    align_horizon, delta_hours, select_base_row, AlignError, BaseRowPolicy, HorizonAlignment,
    DEFAULT_BASE_ROW_LOOKBACK,
};
pub use model::{
    ensure_runtime_compatible, load_model_artifact, save_model_artifact, train_linear_model,
    LinearModel, ModelArtifact, ModelError, ModelRuntime, TrainConfig, TrainingMetrics,
};
pub use observability::{
    init_logging, log_job_finish, log_job_start, log_server_bind, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    latest_forecast, run_feature_build, run_forecast, run_ingest, run_predict_at, run_train,
    FeatureJobReport, ForecastJobReport, IngestReport, PipelineError, PointPrediction,
    TrainReport,
};
pub use readings::{
    dedupe_last_wins, normalize_batch, IngestSummary, NormalizedBatch, Pollutants,
    RawReadingBatch, Reading,
};
pub use server::{
    forecast_router, ErrorResponse, ForecastSnapshotSource, InMemorySnapshotSource,
    LatestForecastResponse, StoreSnapshotSource,
};
pub use source::{
    load_readings_csv, open_meteo_url, parse_open_meteo_payload, CsvReadingSource, HttpFetcher,
    OpenMeteoSource, ReadingSource, ReqwestBlockingFetcher, SourceError,
};
pub use store::{
    BulkWriteReport, DocumentStore, ItemFailure, MemoryStore, SqliteStore, StoreError,
};
pub use timestamp::{
    floor_to_hour, format_instant, is_hour_aligned, normalize_timestamp, now_hour,
    parse_utc_instant, TimestampError,
};
