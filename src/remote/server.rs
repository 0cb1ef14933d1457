use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{decode_ndjson, decompress, MAX_DECODED_BODY};
use crate::export::health::{bind_address, HealthMetrics};
use crate::model::{Metrics, Record};
use crate::pipeline::assembly::Ingress;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::graph::WorkerId;

/// HTTP endpoint receiving batches from peer nodes and, optionally,
/// decoded records from outside the cluster.
///
/// Routes:
/// - `POST /remote/v1/{worker_id}`: NDJSON aggregates for a local worker.
/// - `POST /ingest/v1/records`: NDJSON records, when ingress is enabled.
pub struct RemoteServer {
    addr: String,
    state: Arc<ServerState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

struct ServerState {
    context: Arc<PipelineContext>,
    ingress: Option<Ingress>,
    health: Option<Arc<HealthMetrics>>,
}

impl ServerState {
    fn count(&self, outcome: &str, n: usize) {
        if let Some(h) = &self.health {
            h.remote_received
                .with_label_values(&[outcome])
                .inc_by(n as f64);
        }
    }
}

impl RemoteServer {
    pub fn new(
        addr: &str,
        context: Arc<PipelineContext>,
        ingress: Option<Ingress>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(ServerState {
                context,
                ingress,
                health,
            }),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Binds and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":11800");

        let mut app = Router::new().route("/remote/v1/{worker_id}", post(remote_handler));
        if self.state.ingress.is_some() {
            app = app.route("/ingest/v1/records", post(ingest_handler));
        }
        let app = app.with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "remote server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "remote server error");
            }
        });

        Ok(local_addr)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Stops accepting requests.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Vec<T>> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let raw = decompress(body, encoding, MAX_DECODED_BODY)?;
    decode_ndjson(&raw)
}

/// POST /remote/v1/{worker_id} - aggregates routed here by a peer.
async fn remote_handler(
    State(state): State<Arc<ServerState>>,
    Path(worker_id): Path<u32>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let worker = WorkerId(worker_id);
    let Some(node) = state.context.find_node(worker) else {
        state.count("unknown_worker", 1);
        return (StatusCode::NOT_FOUND, format!("no worker {worker}"));
    };

    let items: Vec<Metrics> = match decode_body(&headers, &body) {
        Ok(items) => items,
        Err(e) => {
            state.count("invalid", 1);
            tracing::warn!(worker = %worker, error = %e, "rejecting remote batch");
            return (StatusCode::BAD_REQUEST, format!("{e:#}"));
        }
    };

    let n = items.len();
    for item in items {
        node.process(item).await;
    }
    state.count("accepted", n);
    tracing::debug!(worker = %worker, items = n, "accepted remote batch");

    (StatusCode::ACCEPTED, n.to_string())
}

/// POST /ingest/v1/records - decoded records from an external source.
async fn ingest_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let Some(ingress) = &state.ingress else {
        return (StatusCode::NOT_FOUND, "ingress disabled".to_string());
    };

    let records: Vec<Record> = match decode_body(&headers, &body) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting ingest batch");
            return (StatusCode::BAD_REQUEST, format!("{e:#}"));
        }
    };

    let n = records.len();
    for record in records {
        if let Err(e) = ingress.submit(record).await {
            return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    }

    (StatusCode::ACCEPTED, n.to_string())
}
