use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "apm_stream";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "apm_stream" namespace and are labeled by worker
/// name where they describe a single worker.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records accepted through ingress.
    pub records_received: Counter,
    /// Items dropped by a full or closed bounded queue.
    pub queue_dropped: CounterVec,
    /// Dispatch decisions by route (local/remote).
    pub dispatch_total: CounterVec,
    /// Items lost after dispatch retries, by reason (transport/routing).
    pub dispatch_failures: CounterVec,
    /// Entries written per flush cycle.
    pub flush_batch_size: HistogramVec,
    /// Duration of a flush cycle including the storage write.
    pub flush_duration: HistogramVec,
    /// Failed flush cycles by stage (read/write).
    pub flush_failures: CounterVec,
    /// Flush ticks skipped because the previous cycle was still running.
    pub flush_skipped: CounterVec,
    /// Items received from peer nodes by outcome.
    pub remote_received: CounterVec,
    /// Alarms raised by rule.
    pub alarms_triggered: CounterVec,
    /// Candidate nodes in the current topology snapshot.
    pub cluster_size: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = Counter::with_opts(
            Opts::new("records_received_total", "Total records accepted by ingress.")
                .namespace(NAMESPACE),
        )?;
        let queue_dropped = CounterVec::new(
            Opts::new(
                "queue_dropped_total",
                "Total items dropped by a full bounded queue.",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )?;
        let dispatch_total = CounterVec::new(
            Opts::new("dispatch_total", "Total dispatch decisions by route.")
                .namespace(NAMESPACE),
            &["worker", "route"],
        )?;
        let dispatch_failures = CounterVec::new(
            Opts::new(
                "dispatch_failures_total",
                "Total items lost after bounded dispatch retries.",
            )
            .namespace(NAMESPACE),
            &["worker", "reason"],
        )?;
        let flush_batch_size = HistogramVec::new(
            HistogramOpts::new("flush_batch_size", "Entries written per flush cycle.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0]),
            &["worker"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to swap, merge and write one flush cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["worker"],
        )?;
        let flush_failures = CounterVec::new(
            Opts::new("flush_failures_total", "Total failed flush cycles by stage.")
                .namespace(NAMESPACE),
            &["worker", "stage"],
        )?;
        let flush_skipped = CounterVec::new(
            Opts::new(
                "flush_skipped_total",
                "Flush ticks skipped while the previous cycle was still running.",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )?;
        let remote_received = CounterVec::new(
            Opts::new(
                "remote_received_total",
                "Total items received from peer nodes by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let alarms_triggered = CounterVec::new(
            Opts::new("alarms_triggered_total", "Total alarms raised by rule.")
                .namespace(NAMESPACE),
            &["rule"],
        )?;
        let cluster_size = GaugeVec::new(
            Opts::new(
                "cluster_size",
                "Candidate nodes in the current topology snapshot.",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_failures.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(flush_skipped.clone()))?;
        registry.register(Box::new(remote_received.clone()))?;
        registry.register(Box::new(alarms_triggered.clone()))?;
        registry.register(Box::new(cluster_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            queue_dropped,
            dispatch_total,
            dispatch_failures,
            flush_batch_size,
            flush_duration,
            flush_failures,
            flush_skipped,
            remote_received,
            alarms_triggered,
            cluster_size,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub(crate) fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
