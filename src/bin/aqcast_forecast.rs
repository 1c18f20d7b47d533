use std::time::Instant;

use aqcast::{
    init_logging, load_model_artifact, log_job_finish, log_job_start, logging_config_from_env,
    now_hour, pipeline_config_from_env, run_forecast, ForecastJobReport, PipelineError,
    SqliteStore,
};

const JOB: &str = "forecast";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_job_start(JOB, &logging_cfg);

    let started = Instant::now();
    let result = run();
    log_job_finish(
        JOB,
        started,
        result.as_ref().map(|_| ()).map_err(|err| err as &dyn std::error::Error),
    );

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run() -> Result<ForecastJobReport, PipelineError> {
    let cfg = pipeline_config_from_env()?;
    cfg.log_config();

    let model = load_model_artifact(&cfg.model_path)?;
    let mut store = SqliteStore::open(&cfg.store_path)?;
    run_forecast(&cfg, &mut store, &model, now_hour())
}
