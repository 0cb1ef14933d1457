use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::{compress, content_encoding, encode_ndjson, RemoteClient};
use crate::cluster::NodeRef;
use crate::model::Metrics;
use crate::pipeline::graph::WorkerId;

/// Sends batches to peer nodes as NDJSON over HTTP POST.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    compression: String,
}

impl HttpRemoteClient {
    pub fn new(timeout: Duration, compression: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            compression: compression.into(),
        })
    }
}

/// Path a peer's remote server accepts batches for `worker` on.
pub fn remote_path(worker: WorkerId) -> String {
    format!("/remote/v1/{worker}")
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn send(&self, node: &NodeRef, worker: WorkerId, items: &[Metrics]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let buf = encode_ndjson(items)?;
        let raw_len = buf.len();
        let body = compress(&buf, &self.compression).context("compressing NDJSON data")?;

        let url = format!("http://{}{}", node.address, remote_path(worker));
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("sending batch to {url}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("remote node {} answered {status}", node.address);
        }

        tracing::debug!(
            node = %node.address,
            worker = %worker,
            items = items.len(),
            bytes = raw_len,
            "sent batch to remote node",
        );

        Ok(())
    }
}
