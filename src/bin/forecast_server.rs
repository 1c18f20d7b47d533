use std::sync::Arc;

use aqcast::{
    forecast_router, init_logging, log_job_start, log_server_bind, logging_config_from_env,
    pipeline_config_from_env, ForecastSnapshotSource, SqliteStore, StoreSnapshotSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_job_start("forecast_server", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    cfg.log_config();

    let store = SqliteStore::open(&cfg.store_path)?;
    let source: Arc<dyn ForecastSnapshotSource> = Arc::new(StoreSnapshotSource::new(store));
    let app = forecast_router(source, cfg.city.name.clone());

    let listener = tokio::net::TcpListener::bind(cfg.server_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_server_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
