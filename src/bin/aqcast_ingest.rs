use std::path::PathBuf;
use std::time::Instant;

use aqcast::{
    init_logging, log_job_finish, log_job_start, logging_config_from_env, now_hour,
    pipeline_config_from_env, run_ingest, CsvReadingSource, IngestReport, OpenMeteoSource,
    PipelineError, ReadingSource, SqliteStore,
};

const JOB: &str = "ingest";

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

fn run() -> Result<IngestReport, PipelineError> {
    let cfg = pipeline_config_from_env()?;
    cfg.log_config();

    // AQCAST_SOURCE_CSV switches to an offline backfill file.
    let source: Box<dyn ReadingSource> = match std::env::var("AQCAST_SOURCE_CSV") {
        Ok(path) if !path.trim().is_empty() => {
            Box::new(CsvReadingSource::new(PathBuf::from(path.trim())))
        }
        _ => Box::new(OpenMeteoSource::new(&cfg.city, &cfg.source)?),
    };

    let mut store = SqliteStore::open(&cfg.store_path)?;
    run_ingest(&cfg, source.as_ref(), &mut store, now_hour())
}
