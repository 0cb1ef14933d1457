//! Node-to-node transport for remote dispatch.

pub mod http;
pub mod loopback;
pub mod server;

use std::io::{Read, Write};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::cluster::NodeRef;
use crate::model::Metrics;
use crate::pipeline::graph::WorkerId;

pub use http::HttpRemoteClient;
pub use loopback::LoopbackClient;
pub use server::RemoteServer;

/// Largest request body accepted after decompression.
pub const MAX_DECODED_BODY: usize = 64 * 1024 * 1024;

/// Delivers a batch of aggregates to a worker on another node.
///
/// Delivery is at-most-once per call: an `Err` means the batch may or may
/// not have been applied remotely.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn send(&self, node: &NodeRef, worker: WorkerId, items: &[Metrics]) -> Result<()>;
}

/// Serializes aggregates as newline-delimited JSON.
pub fn encode_ndjson<T: serde::Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(items.len() * 256);
    for item in items {
        serde_json::to_writer(&mut buf, item).context("serializing item to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Parses newline-delimited JSON. Blank lines are skipped.
pub fn decode_ndjson<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<Vec<T>> {
    body.split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(i, line)| {
            serde_json::from_slice(line).with_context(|| format!("parsing NDJSON line {}", i + 1))
        })
        .collect()
}

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => anyhow::bail!("unsupported compression: {other}"),
    }
}

/// Reverses [`compress`] given the request's Content-Encoding. Fails once
/// the decoded body would exceed `limit` bytes.
pub fn decompress(data: &[u8], encoding: Option<&str>, limit: usize) -> Result<Vec<u8>> {
    let out = match encoding {
        None | Some("identity") => data.to_vec(),
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .context("gzip decode")?;
            out
        }
        Some(other) => anyhow::bail!("unsupported content encoding: {other}"),
    };
    if out.len() > limit {
        anyhow::bail!("decoded body exceeds {limit} bytes");
    }
    Ok(out)
}

/// Returns the Content-Encoding header value for the algorithm.
pub fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Record};

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"{\"calls\":1}\n{\"calls\":2}\n";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());
        let restored = decompress(&compressed, content_encoding("gzip"), MAX_DECODED_BODY)
            .expect("gzip decode");
        assert_eq!(restored, data);
    }

    #[test]
    fn test_compress_none() {
        assert_eq!(compress(b"abc", "none").expect("none"), b"abc");
        assert!(content_encoding("none").is_none());
        assert!(compress(b"abc", "brotli").is_err());
        assert!(decompress(b"abc", Some("br"), MAX_DECODED_BODY).is_err());
    }

    #[test]
    fn test_decompress_stops_at_limit() {
        let data = vec![0u8; 1 << 20];
        let compressed = compress(&data, "gzip").expect("gzip compress");
        assert!(compressed.len() < 16 * 1024);

        let err = decompress(&compressed, Some("gzip"), 64 * 1024).expect_err("over limit");
        assert!(err.to_string().contains("exceeds"));
        assert!(decompress(&data, None, 64 * 1024).is_err());

        let restored = decompress(&compressed, Some("gzip"), data.len()).expect("at limit");
        assert_eq!(restored.len(), data.len());
    }

    #[test]
    fn test_ndjson_skips_blank_lines() {
        let items = vec![
            Metrics::from_record(&Record::new(MetricKind::Service, 100, "A").with_calls(1, 0, 0)),
            Metrics::from_record(&Record::new(MetricKind::Service, 100, "B").with_calls(2, 0, 0)),
        ];
        let mut body = encode_ndjson(&items).expect("encode");
        body.extend_from_slice(b"\n  \n");
        let decoded: Vec<Metrics> = decode_ndjson(&body).expect("decode");
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_ndjson_reports_bad_line() {
        let err = decode_ndjson::<Metrics>(b"{}\n").expect_err("invalid line");
        assert!(err.to_string().contains("line 1"));
    }
}
