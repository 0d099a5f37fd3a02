//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
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
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "workload_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    /// Keys re-enqueued with backoff
    pub static ref REQUEUES: CounterVec = register_counter_vec!(
        "workload_backup_operator_requeues_total",
        "Total number of rate-limited requeues",
        &["kind"]
    ).unwrap();

    /// Keys dropped after a terminal error or retry exhaustion
    pub static ref DROPPED_KEYS: CounterVec = register_counter_vec!(
        "workload_backup_operator_dropped_keys_total",
        "Total number of keys dropped out of the work queue",
        &["kind"]
    ).unwrap();

    /// Pod template mutations by workload kind and operation
    pub static ref SIDECAR_OPERATIONS: CounterVec = register_counter_vec!(
        "workload_backup_operator_sidecar_operations_total",
        "Total number of sidecar injections, removals and initializer releases",
        &["kind", "operation"]
    ).unwrap();

    /// Succeeded jobs deleted by the job collector
    pub static ref JOBS_COLLECTED: CounterVec = register_counter_vec!(
        "workload_backup_operator_jobs_collected_total",
        "Total number of succeeded jobs deleted",
        &["namespace"]
    ).unwrap();

    /// Recoveries by outcome
    pub static ref RECOVERIES_TOTAL: CounterVec = register_counter_vec!(
        "workload_backup_operator_recoveries_total",
        "Total number of recoveries by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "workload_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Number of watched collections whose cache has not synced yet
static PENDING_SYNCS: AtomicUsize = AtomicUsize::new(0);

/// Register a cache that must sync before `/readyz` reports ready
pub fn expect_sync() {
    PENDING_SYNCS.fetch_add(1, Ordering::SeqCst);
}

/// Mark one registered cache as synced
pub fn mark_synced() {
    let _ = PENDING_SYNCS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Ready once every watched cache has synced
fn ready_response() -> Response<Full<Bytes>> {
    if PENDING_SYNCS.load(Ordering::SeqCst) == 0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "caches syncing")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
