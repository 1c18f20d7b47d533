use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use aqcast::{
    build_feature_rows, forecast_router, log_job_finish, log_job_start, log_server_bind,
    FeatureConfig, InMemorySnapshotSource, LoggingConfig, PipelineError, Pollutants, Reading,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration, TimeZone, Utc};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

#[test]
fn feature_build_logs_gaps_and_summary() {
    let start = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid start");
    let readings: Vec<Reading> = (0..40)
        .filter(|h| *h != 12)
        .map(|h| Reading {
            city: "Karachi".to_string(),
            instant: start + Duration::hours(h),
            source: "test".to_string(),
            pollutants: Pollutants::pm25_only(30.0),
        })
        .collect();

    let logs = capture_logs(Level::INFO, || {
        build_feature_rows(
            "Karachi",
            &readings,
            &FeatureConfig::with_horizon(1),
            start + Duration::hours(39),
        )
        .expect("build succeeds");
    });

    assert!(logs.contains("\"event\":\"features.build.start\""));
    assert!(logs.contains("\"event\":\"features.build.gap_detected\""));
    assert!(logs.contains("\"event\":\"features.build.finish\""));
    assert!(logs.contains("\"component\":\"features\""));
}

#[test]
fn job_lifecycle_helpers_emit_start_and_finish() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_job_start("aqcast_forecast", &cfg);
        log_job_finish("aqcast_forecast", Instant::now(), Ok(()));

        let err = PipelineError::NoForecast {
            city: "Karachi".to_string(),
        };
        let err: &dyn std::error::Error = &err;
        log_job_finish("aqcast_predict_at", Instant::now(), Err(err));
        log_server_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"job.start\""));
    assert!(logs.contains("\"event\":\"job.finish\""));
    assert!(logs.contains("\"level\":\"ERROR\""));
    assert!(logs.contains("no forecast stored for city 'Karachi'"));
    assert!(logs.contains("\"event\":\"server.bind\""));
}

#[test]
fn latest_route_emits_http_request_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let source = Arc::new(InMemorySnapshotSource::new(vec![aqcast::ForecastSnapshot {
                city: "Karachi".to_string(),
                base_time: Utc
                    .with_ymd_and_hms(2026, 1, 26, 12, 0, 0)
                    .single()
                    .expect("valid base"),
                rows: Vec::new(),
            }]));
            let app = forecast_router(source, "Karachi");

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/forecast/latest")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("latest request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.latest.request\""));
}
