//! Raw hourly reading sources: Open-Meteo over HTTP and local CSV files.

use std::fs;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{CityConfig, SourceConfig};
use crate::readings::RawReadingBatch;

const HOURLY_FIELDS: &str = "pm10,pm2_5,carbon_monoxide,nitrogen_dioxide,sulphur_dioxide,ozone";
const CSV_COLUMNS: [&str; 7] = ["timestamp", "pm2_5", "pm10", "co", "no2", "so2", "o3"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("malformed payload from {url}: {message}")]
    MalformedPayload { url: String, message: String },
    #[error("series '{field}' has {found} values, expected {expected} (one per timestamp)")]
    MismatchedSeries {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV file {path} is missing column '{column}'")]
    MissingCsvColumn { path: PathBuf, column: &'static str },
    #[error("failed to parse {field} value '{value}' on CSV line {line}")]
    ParseField {
        field: &'static str,
        value: String,
        line: u64,
    },
}

/// Pull-based provider of one city's hourly pollutant arrays.
pub trait ReadingSource {
    fn name(&self) -> &str;
    fn fetch_hourly(&self) -> Result<RawReadingBatch, SourceError>;
}

pub trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoPayload {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    pm2_5: Vec<Option<f64>>,
    #[serde(default)]
    pm10: Vec<Option<f64>>,
    #[serde(default)]
    carbon_monoxide: Vec<Option<f64>>,
    #[serde(default)]
    nitrogen_dioxide: Vec<Option<f64>>,
    #[serde(default)]
    sulphur_dioxide: Vec<Option<f64>>,
    #[serde(default)]
    ozone: Vec<Option<f64>>,
}

pub struct OpenMeteoSource<F: HttpFetcher = ReqwestBlockingFetcher> {
    url: String,
    fetcher: F,
}

impl OpenMeteoSource<ReqwestBlockingFetcher> {
    pub fn new(city: &CityConfig, cfg: &SourceConfig) -> Result<Self, SourceError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self::with_fetcher(city, cfg, fetcher))
    }
}

impl<F: HttpFetcher> OpenMeteoSource<F> {
    pub fn with_fetcher(city: &CityConfig, cfg: &SourceConfig, fetcher: F) -> Self {
        Self {
            url: open_meteo_url(city, cfg),
            fetcher,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<F: HttpFetcher> ReadingSource for OpenMeteoSource<F> {
    fn name(&self) -> &str {
        "open-meteo"
    }

    fn fetch_hourly(&self) -> Result<RawReadingBatch, SourceError> {
        debug!(
            component = "source",
            event = "source.open_meteo.request",
            url = %self.url
        );
        let bytes = self.fetcher.get_bytes(&self.url)?;
        let batch = parse_open_meteo_payload(&self.url, &bytes)?;
        info!(
            component = "source",
            event = "source.open_meteo.fetched",
            points = batch.len()
        );
        Ok(batch)
    }
}

/// Builds the air-quality request URL. Forecast days are always zero;
/// anything after the current hour is filtered downstream regardless.
pub fn open_meteo_url(city: &CityConfig, cfg: &SourceConfig) -> String {
    format!(
        "{base}?latitude={lat}&longitude={lon}&hourly={HOURLY_FIELDS}&timezone=UTC&past_days={past}&forecast_days=0",
        base = cfg.base_url,
        lat = city.latitude,
        lon = city.longitude,
        past = cfg.past_days,
    )
}

pub fn parse_open_meteo_payload(url: &str, bytes: &[u8]) -> Result<RawReadingBatch, SourceError> {
    let payload: OpenMeteoPayload =
        serde_json::from_slice(bytes).map_err(|err| SourceError::MalformedPayload {
            url: url.to_string(),
            message: err.to_string(),
        })?;
    let hourly = payload.hourly;
    let len = hourly.time.len();

    Ok(RawReadingBatch {
        pm2_5: hourly.pm2_5,
        pm10: fill_missing(hourly.pm10, len),
        co: fill_missing(hourly.carbon_monoxide, len),
        no2: fill_missing(hourly.nitrogen_dioxide, len),
        so2: fill_missing(hourly.sulphur_dioxide, len),
        o3: fill_missing(hourly.ozone, len),
        timestamps: hourly.time,
    })
}

// Secondary pollutants may be absent from the payload entirely.
fn fill_missing(values: Vec<Option<f64>>, len: usize) -> Vec<Option<f64>> {
    if values.is_empty() {
        vec![None; len]
    } else {
        values
    }
}

/// Headered CSV with columns `timestamp,pm2_5,pm10,co,no2,so2,o3`.
/// Empty cells are nulls; only `timestamp` and `pm2_5` columns are required.
pub struct CsvReadingSource {
    path: PathBuf,
}

impl CsvReadingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReadingSource for CsvReadingSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch_hourly(&self) -> Result<RawReadingBatch, SourceError> {
        let batch = load_readings_csv(&self.path)?;
        info!(
            component = "source",
            event = "source.csv.loaded",
            path = %self.path.display(),
            points = batch.len()
        );
        Ok(batch)
    }
}

pub fn load_readings_csv(path: &Path) -> Result<RawReadingBatch, SourceError> {
    let bytes = fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes.as_slice());

    let headers = reader.headers()?.clone();
    let mut positions = [None; CSV_COLUMNS.len()];
    for (slot, column) in positions.iter_mut().zip(CSV_COLUMNS) {
        *slot = headers.iter().position(|h| h.eq_ignore_ascii_case(column));
    }
    for required in [0usize, 1] {
        if positions[required].is_none() {
            return Err(SourceError::MissingCsvColumn {
                path: path.to_path_buf(),
                column: CSV_COLUMNS[required],
            });
        }
    }

    let mut batch = RawReadingBatch::default();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        batch
            .timestamps
            .push(cell(&record, positions[0]).unwrap_or_default().to_string());
        batch.pm2_5.push(parse_cell(&record, positions[1], "pm2_5", line)?);
        batch.pm10.push(parse_cell(&record, positions[2], "pm10", line)?);
        batch.co.push(parse_cell(&record, positions[3], "co", line)?);
        batch.no2.push(parse_cell(&record, positions[4], "no2", line)?);
        batch.so2.push(parse_cell(&record, positions[5], "so2", line)?);
        batch.o3.push(parse_cell(&record, positions[6], "o3", line)?);
    }

    Ok(batch)
}

fn cell(record: &StringRecord, position: Option<usize>) -> Option<&str> {
    position.and_then(|idx| record.get(idx))
}

fn parse_cell(
    record: &StringRecord,
    position: Option<usize>,
    field: &'static str,
    line: u64,
) -> Result<Option<f64>, SourceError> {
    match cell(record, position) {
        None | Some("") => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("nan") => {
            Ok(None)
        }
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| SourceError::ParseField {
                field,
                value: raw.to_string(),
                line,
            }),
    }
}
