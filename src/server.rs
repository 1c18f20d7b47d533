//! Read-only HTTP surface over the latest materialized forecast.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::forecast::{ForecastPoint, ForecastSnapshot};
use crate::store::{DocumentStore, StoreError};
use crate::timestamp;

pub trait ForecastSnapshotSource: Send + Sync + 'static {
    fn latest(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError>;
}

/// Serves whatever a [`DocumentStore`] currently holds.
pub struct StoreSnapshotSource<S> {
    store: Mutex<S>,
}

impl<S: DocumentStore + Send + 'static> StoreSnapshotSource<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

impl<S: DocumentStore + Send + 'static> ForecastSnapshotSource for StoreSnapshotSource<S> {
    fn latest(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.latest_forecast(city)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySnapshotSource {
    inner: Arc<RwLock<Vec<ForecastSnapshot>>>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshots: Vec<ForecastSnapshot>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshots)),
        }
    }

    /// Replaces the snapshot held for `snapshot.city`.
    pub fn replace_snapshot(&self, snapshot: ForecastSnapshot) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|existing| existing.city != snapshot.city);
        guard.push(snapshot);
    }
}

impl ForecastSnapshotSource for InMemorySnapshotSource {
    fn latest(&self, city: &str) -> Result<Option<ForecastSnapshot>, StoreError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.iter().find(|s| s.city == city).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestForecastResponse {
    pub ok: bool,
    pub city: String,
    pub base_time: String,
    pub count: usize,
    pub rows: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestForecastQuery {
    pub city: Option<String>,
}

#[derive(Clone)]
struct ForecastAppState {
    source: Arc<dyn ForecastSnapshotSource>,
    default_city: String,
}

pub fn forecast_router(
    source: Arc<dyn ForecastSnapshotSource>,
    default_city: impl Into<String>,
) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/forecast/latest", get(get_latest_forecast))
        .with_state(ForecastAppState {
            source,
            default_city: default_city.into(),
        })
}

async fn get_health() -> &'static str {
    "ok"
}

async fn get_latest_forecast(
    State(state): State<ForecastAppState>,
    Query(query): Query<LatestForecastQuery>,
) -> Response {
    let city = query
        .city
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| state.default_city.clone());

    match state.source.latest(&city) {
        Ok(Some(snapshot)) => {
            info!(
                component = "forecast_server",
                event = "http.latest.request",
                city = %city,
                rows = snapshot.rows.len()
            );
            Json(LatestForecastResponse {
                ok: true,
                base_time: timestamp::format_instant(snapshot.base_time),
                count: snapshot.rows.len(),
                city: snapshot.city,
                rows: snapshot.rows,
            })
            .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                ok: false,
                error: format!("no forecast found for city '{city}'"),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(
                component = "forecast_server",
                event = "http.latest.error",
                city = %city,
                error = %err
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    ok: false,
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}
