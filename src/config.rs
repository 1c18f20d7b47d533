//! Pipeline configuration loaded from `AQCAST_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::FeatureConfig;
use crate::horizon::{BaseRowPolicy, DEFAULT_BASE_ROW_LOOKBACK};
use crate::timestamp::parse_utc_instant;

pub const DEFAULT_OPEN_METEO_URL: &str = "https://air-quality-api.open-meteo.com/v1/air-quality";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityConfig {
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for CityConfig {
    fn default() -> Self {
        Self {
            name: "Karachi".to_string(),
            country: "Pakistan".to_string(),
            latitude: 24.8607,
            longitude: 67.0011,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub past_days: u32,
    pub http_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPEN_METEO_URL.to_string(),
            past_days: 7,
            http_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub city: CityConfig,
    pub store_path: PathBuf,
    pub features: FeatureConfig,
    pub model_path: PathBuf,
    pub base_row_policy: BaseRowPolicy,
    pub source: SourceConfig,
    pub server_addr: SocketAddr,
}

impl PipelineConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        let features = FeatureConfig::default();
        Self {
            city: CityConfig::default(),
            store_path: store_path.into(),
            model_path: default_model_path(features.horizon_hours),
            features,
            base_row_policy: BaseRowPolicy::Nearest,
            source: SourceConfig::default(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }

    pub fn horizon_hours(&self) -> u32 {
        self.features.horizon_hours
    }

    pub fn log_config(&self) {
        info!(
            component = "config",
            event = "config.loaded",
            city = %self.city.name,
            country = %self.city.country,
            latitude = self.city.latitude,
            longitude = self.city.longitude,
            store_path = %self.store_path.display(),
            model_path = %self.model_path.display(),
            horizon_hours = self.features.horizon_hours,
            lags_hours = ?self.features.lags_hours,
            mean_windows_hours = ?self.features.mean_windows_hours,
            std_windows_hours = ?self.features.std_windows_hours,
            base_row_policy = ?self.base_row_policy
        );
    }
}

pub fn default_model_path(horizon_hours: u32) -> PathBuf {
    PathBuf::from(format!("models/pm25_next{horizon_hours}h.json"))
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

/// Same as [`pipeline_config_from_env`] with an injectable variable lookup.
pub fn pipeline_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let store_path = get("AQCAST_STORE_PATH").ok_or(ConfigError::Missing("AQCAST_STORE_PATH"))?;
    let mut cfg = PipelineConfig::new(store_path);

    if let Some(name) = get("AQCAST_CITY") {
        cfg.city.name = name;
    }
    if let Some(country) = get("AQCAST_COUNTRY") {
        cfg.city.country = country;
    }
    if let Some(raw) = get("AQCAST_LATITUDE") {
        cfg.city.latitude = parse_value("AQCAST_LATITUDE", &raw)?;
    }
    if let Some(raw) = get("AQCAST_LONGITUDE") {
        cfg.city.longitude = parse_value("AQCAST_LONGITUDE", &raw)?;
    }

    if let Some(raw) = get("AQCAST_HORIZON_HOURS") {
        cfg.features.horizon_hours = parse_value("AQCAST_HORIZON_HOURS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_LAGS_HOURS") {
        cfg.features.lags_hours = parse_list("AQCAST_LAGS_HOURS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_MEAN_WINDOWS_HOURS") {
        cfg.features.mean_windows_hours = parse_list("AQCAST_MEAN_WINDOWS_HOURS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_STD_WINDOWS_HOURS") {
        cfg.features.std_windows_hours = parse_list("AQCAST_STD_WINDOWS_HOURS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_HISTORY_MARGIN") {
        cfg.features.history_margin = parse_value("AQCAST_HISTORY_MARGIN", &raw)?;
    }
    cfg.features
        .validate()
        .map_err(|err| ConfigError::Invalid {
            key: "AQCAST_FEATURES",
            value: format!("{:?}", cfg.features),
            reason: err.to_string(),
        })?;

    cfg.model_path = get("AQCAST_MODEL_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_model_path(cfg.features.horizon_hours));

    let lookback = match get("AQCAST_BASE_ROW_LOOKBACK") {
        Some(raw) => parse_value("AQCAST_BASE_ROW_LOOKBACK", &raw)?,
        None => DEFAULT_BASE_ROW_LOOKBACK,
    };
    if let Some(raw) = get("AQCAST_BASE_ROW_POLICY") {
        cfg.base_row_policy = match raw.to_ascii_lowercase().as_str() {
            "nearest" => BaseRowPolicy::Nearest,
            "latest_complete" => BaseRowPolicy::LatestComplete { lookback },
            _ => {
                return Err(ConfigError::Invalid {
                    key: "AQCAST_BASE_ROW_POLICY",
                    value: raw,
                    reason: "expected 'nearest' or 'latest_complete'".to_string(),
                })
            }
        };
    }

    if let Some(url) = get("AQCAST_SOURCE_URL") {
        cfg.source.base_url = url;
    }
    if let Some(raw) = get("AQCAST_PAST_DAYS") {
        cfg.source.past_days = parse_value("AQCAST_PAST_DAYS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_HTTP_TIMEOUT_MS") {
        cfg.source.http_timeout_ms = parse_value("AQCAST_HTTP_TIMEOUT_MS", &raw)?;
    }
    if let Some(raw) = get("AQCAST_SERVER_ADDR") {
        cfg.server_addr = parse_value("AQCAST_SERVER_ADDR", &raw)?;
    }

    Ok(cfg)
}

/// Reads `AQCAST_TARGET_TIME_UTC` for the on-demand prediction job.
pub fn target_time_from_env() -> Result<DateTime<Utc>, ConfigError> {
    target_time_from_lookup(|key| env::var(key).ok())
}

pub fn target_time_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DateTime<Utc>, ConfigError> {
    let raw = lookup("AQCAST_TARGET_TIME_UTC")
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing("AQCAST_TARGET_TIME_UTC"))?;
    parse_utc_instant(&raw).map_err(|err| ConfigError::Invalid {
        key: "AQCAST_TARGET_TIME_UTC",
        value: raw.clone(),
        reason: err.to_string(),
    })
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_list(key: &'static str, raw: &str) -> Result<Vec<u32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_value(key, part))
        .collect()
}
