//! Logging configuration from `AQCAST_LOG_*` and job lifecycle events.

use std::env;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Unset, blank or unparsable variables keep the default.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("AQCAST_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }
    if let Some(format) = lookup("AQCAST_LOG_FORMAT").as_deref().and_then(parse_log_format) {
        config.format = format;
    }
    if let Some(include_target) = lookup("AQCAST_LOG_TARGET").as_deref().and_then(parse_bool) {
        config.include_target = include_target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_job_start(job: &str, config: &LoggingConfig) {
    info!(
        component = "job",
        event = "job.start",
        job,
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_job_finish(job: &str, started: Instant, outcome: Result<(), &dyn std::error::Error>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => info!(
            component = "job",
            event = "job.finish",
            job,
            elapsed_ms,
            ok = true
        ),
        Err(err) => error!(
            component = "job",
            event = "job.finish",
            job,
            elapsed_ms,
            ok = false,
            error = %err
        ),
    }
}

pub fn log_server_bind(bound_addr: SocketAddr) {
    info!(
        component = "forecast_server",
        event = "server.bind",
        bind_addr = %bound_addr,
        route = "/forecast/latest"
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> LoggingConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        logging_config_from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(config_from(&[]), LoggingConfig::default());
        assert_eq!(config_from(&[("AQCAST_LOG_LEVEL", "   ")]).level, "info");
    }

    #[test]
    fn json_format_level_and_target_are_read() {
        let cfg = config_from(&[
            ("AQCAST_LOG_LEVEL", " aqcast=debug,warn "),
            ("AQCAST_LOG_FORMAT", "JSON"),
            ("AQCAST_LOG_TARGET", "off"),
        ]);

        assert_eq!(cfg.level, "aqcast=debug,warn");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unknown_format_or_target_keeps_defaults() {
        let cfg = config_from(&[
            ("AQCAST_LOG_FORMAT", "yaml"),
            ("AQCAST_LOG_TARGET", "sometimes"),
        ]);

        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
    }

    #[test]
    fn bool_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "No", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
    }
}
