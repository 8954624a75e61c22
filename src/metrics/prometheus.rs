//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "workload_backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "workload_backup_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind", "error"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "workload_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys dropped after exhausting their retries
    pub static ref DROPPED_KEYS: CounterVec = register_counter_vec!(
        "workload_backup_operator_dropped_keys_total",
        "Keys dropped from the work queue after the retry limit",
        &["kind"]
    ).unwrap();

    /// Keys ready in each work queue
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "workload_backup_operator_queue_depth",
        "Number of keys waiting in the work queue",
        &["queue"]
    ).unwrap();

    /// Workload pod template mutations
    pub static ref SIDECAR_MUTATIONS: CounterVec = register_counter_vec!(
        "workload_backup_operator_sidecar_mutations_total",
        "Pod template mutations by action and workload kind",
        &["action", "workload_kind"]
    ).unwrap();

    /// Recovery jobs by outcome
    pub static ref RECOVERY_JOBS: CounterVec = register_counter_vec!(
        "workload_backup_operator_recovery_jobs_total",
        "Recovery jobs by outcome",
        &["outcome"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "workload_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Set once both controllers are running, cleared on shutdown
static READY: AtomicBool = AtomicBool::new(false);

/// Flip the readiness probe
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
    OPERATOR_HEALTH.set(if ready { 1.0 } else { 0.0 });
}

/// Serve `/metrics`, `/healthz` and `/readyz` until `shutdown` fires
pub async fn serve(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?.0,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }

    info!("Metrics server stopped");
    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if READY.load(Ordering::SeqCst) => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_follows_flag() {
        set_ready(true);
        assert!(READY.load(Ordering::SeqCst));
        assert_eq!(OPERATOR_HEALTH.get(), 1.0);
        set_ready(false);
        assert!(!READY.load(Ordering::SeqCst));
    }

    #[test]
    fn text_sets_status() {
        let response = text(StatusCode::SERVICE_UNAVAILABLE, "not ready");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
