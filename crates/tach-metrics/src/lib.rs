//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Metrics collection and export utilities."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across harness components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to resolve metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address (resolved when an ephemeral port was requested).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Run-level metrics recorded by the scenario runner.
#[derive(Clone)]
pub struct HarnessMetrics {
    registry: SharedRegistry,
    runs_total: IntCounterVec,
    checkpoints_total: IntCounterVec,
    run_real_seconds: HistogramVec,
    active_runs: IntGauge,
}

impl HarnessMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new(
                "tach_runs_total",
                "Scenario runs by terminal status",
            ),
            &["scenario", "status"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let checkpoints_total = IntCounterVec::new(
            Opts::new(
                "tach_checkpoints_total",
                "Assertion outcomes recorded at scenario checkpoints",
            ),
            &["scenario", "outcome"],
        )?;
        registry.register(Box::new(checkpoints_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let run_real_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tach_run_real_seconds",
                "Wall-clock duration of scenario runs",
            )
            .buckets(buckets),
            &["scenario"],
        )?;
        registry.register(Box::new(run_real_seconds.clone()))?;

        let active_runs = IntGauge::with_opts(Opts::new(
            "tach_active_runs",
            "Scenario runs currently between Preparing and a terminal state",
        ))?;
        registry.register(Box::new(active_runs.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            checkpoints_total,
            run_real_seconds,
            active_runs,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn run_started(&self) {
        self.active_runs.inc();
    }

    pub fn run_finished(&self, scenario: &str, status: &str, real_elapsed: Duration) {
        self.active_runs.dec();
        self.runs_total.with_label_values(&[scenario, status]).inc();
        self.run_real_seconds
            .with_label_values(&[scenario])
            .observe(real_elapsed.as_secs_f64());
    }

    pub fn record_assertion(&self, scenario: &str, passed: bool) {
        let outcome = if passed { "pass" } else { "fail" };
        self.checkpoints_total
            .with_label_values(&[scenario, outcome])
            .inc();
    }
}

impl std::fmt::Debug for HarnessMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn harness_metrics_register_families() {
        let registry = new_registry();
        let metrics = HarnessMetrics::new(registry.clone()).unwrap();
        metrics.run_started();
        metrics.record_assertion("soak", true);
        metrics.record_assertion("soak", false);
        metrics.run_finished("soak", "failed", Duration::from_millis(120));

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|fam| fam.get_name().to_string())
            .collect();
        assert!(names.contains(&"tach_runs_total".to_string()));
        assert!(names.contains(&"tach_checkpoints_total".to_string()));
        assert!(names.contains(&"tach_run_real_seconds".to_string()));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        HarnessMetrics::new(registry.clone()).unwrap();
        assert!(HarnessMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registry() {
        let registry = new_registry();
        let metrics = HarnessMetrics::new(registry.clone()).unwrap();
        metrics.record_assertion("burst", true);
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("200 OK"));
        assert!(body.contains("tach_checkpoints_total"));
        let content_type = body
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-type").then(|| value.trim().to_string())
            })
            .expect("content-type header");
        assert_eq!(content_type, prometheus::TEXT_FORMAT);

        server.shutdown().await.unwrap();
    }
}
