use std::time::Instant;

use aqcast::{
    init_logging, load_model_artifact, log_job_finish, log_job_start, logging_config_from_env,
    now_hour, pipeline_config_from_env, run_predict_at, target_time_from_env, PipelineError,
    PointPrediction, SqliteStore,
};

const JOB: &str = "predict_at";

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

    let prediction = result?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

fn run() -> Result<PointPrediction, PipelineError> {
    let cfg = pipeline_config_from_env()?;
    let query_instant = target_time_from_env()?;
    cfg.log_config();

    let model = load_model_artifact(&cfg.model_path)?;
    let store = SqliteStore::open(&cfg.store_path)?;
    run_predict_at(&cfg, &store, &model, now_hour(), query_instant)
}
