//! Turns an H-length prediction vector into per-horizon forecast points.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::aqi::{aqi_for_pm25, AqiCategory};
use crate::timestamp;

const PREDICTION_DECIMALS: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub city: String,
    #[serde(with = "timestamp::canonical")]
    pub base_time: DateTime<Utc>,
    pub horizon_hours: u32,
    #[serde(with = "timestamp::canonical")]
    pub target_time: DateTime<Utc>,
    pub predicted_pm2_5: f64,
    pub aqi_index: Option<u16>,
    pub aqi_category: AqiCategory,
    #[serde(with = "timestamp::canonical")]
    pub created_at: DateTime<Utc>,
}

/// All points of the newest materialized run for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub city: String,
    #[serde(with = "timestamp::canonical")]
    pub base_time: DateTime<Utc>,
    /// Ascending by horizon.
    pub rows: Vec<ForecastPoint>,
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("prediction vector has {actual} entries, expected {expected}")]
    PredictionLength { expected: usize, actual: usize },
    #[error("prediction for horizon {horizon_hours}h is not finite ({value})")]
    NonFinitePrediction { horizon_hours: u32, value: f64 },
}

/// Builds one point per horizon `1..=H` from `predictions[h - 1]`.
///
/// `created_at` is supplied by the caller (the run's `now_hour`). Stores
/// keep the first value written for a key.
pub fn materialize_forecast(
    city: &str,
    base_time: DateTime<Utc>,
    predictions: &[f64],
    horizon_hours: u32,
    created_at: DateTime<Utc>,
) -> Result<Vec<ForecastPoint>, ForecastError> {
    if predictions.len() != horizon_hours as usize {
        return Err(ForecastError::PredictionLength {
            expected: horizon_hours as usize,
            actual: predictions.len(),
        });
    }

    let mut points = Vec::with_capacity(predictions.len());
    for (h, value) in (1..=horizon_hours).zip(predictions.iter().copied()) {
        if !value.is_finite() {
            return Err(ForecastError::NonFinitePrediction {
                horizon_hours: h,
                value,
            });
        }
        points.push(forecast_point(city, base_time, h, value, created_at));
    }

    info!(
        component = "forecast",
        event = "forecast.materialize.finish",
        city,
        base_time = %timestamp::format_instant(base_time),
        points = points.len()
    );

    Ok(points)
}

pub fn forecast_point(
    city: &str,
    base_time: DateTime<Utc>,
    horizon_hours: u32,
    predicted: f64,
    created_at: DateTime<Utc>,
) -> ForecastPoint {
    let aqi = aqi_for_pm25(predicted);
    let predicted_pm2_5 = round_decimals(predicted, PREDICTION_DECIMALS);
    ForecastPoint {
        city: city.to_string(),
        base_time,
        horizon_hours,
        target_time: base_time + Duration::hours(i64::from(horizon_hours)),
        predicted_pm2_5,
        aqi_index: aqi.index,
        aqi_category: aqi.category,
        created_at,
    }
}

fn round_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}
