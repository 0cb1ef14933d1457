use std::sync::Arc;
use std::time::Duration;

use apm_stream::cluster::{NodeRef, StaticMembership};
use apm_stream::config::Config;
use apm_stream::model::{MetricKind, Metrics, Record};
use apm_stream::node::CollectorNode;
use apm_stream::pipeline::assembly::{assemble, stage, Ingress, Services};
use apm_stream::pipeline::graph::WorkerId;
use apm_stream::remote::{
    encode_ndjson, HttpRemoteClient, LoopbackClient, RemoteClient, RemoteServer,
};
use apm_stream::storage::MemoryStore;
use apm_stream::worker::Worker;

fn local_config() -> Config {
    let mut cfg = Config::default();
    cfg.node.address = "self:11800".to_string();
    cfg.pipeline.downsampling.clear();
    cfg.remote.listen_addr = "127.0.0.1:0".to_string();
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg
}

fn service_a(calls: u64) -> Metrics {
    Metrics::from_record(&Record::new(MetricKind::Service, 100, "A").with_calls(calls, 0, 0))
}

#[tokio::test]
async fn test_http_batch_reaches_target_worker() {
    let store = Arc::new(MemoryStore::new());
    let assembly = assemble(
        &local_config(),
        Services {
            store,
            client: Arc::new(LoopbackClient::new()),
            membership: Arc::new(StaticMembership::new(vec!["self:11800".to_string()])),
            health: None,
        },
    )
    .expect("assemble");

    let server = RemoteServer::new("127.0.0.1:0", Arc::clone(&assembly.context), None, None);
    let addr = server.start().await.expect("start");

    for compression in ["gzip", "none"] {
        let client = HttpRemoteClient::new(Duration::from_secs(5), compression).expect("client");
        let node = NodeRef {
            address: addr.to_string(),
            is_local: false,
        };
        let target = WorkerId::new(MetricKind::Service.graph_id(), stage::AGGREGATE);
        client
            .send(&node, target, &[service_a(1), service_a(2)])
            .await
            .expect("send");

        // Unknown workers are rejected.
        assert!(client.send(&node, WorkerId(9_999), &[service_a(1)]).await.is_err());
    }

    let aggregate = assembly
        .context
        .find_node(WorkerId::new(MetricKind::Service.graph_id(), stage::AGGREGATE))
        .expect("aggregate");
    assert_eq!(aggregate.drain_pending().await, 4);
    let Worker::Aggregate(w) = aggregate.worker() else {
        panic!("not an aggregate worker");
    };
    assert_eq!(w.window().get("100:A").map(|m| m.measures.calls), Some(6));

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_ingest_rejects_malformed_body() {
    let assembly = assemble(
        &local_config(),
        Services {
            store: Arc::new(MemoryStore::new()),
            client: Arc::new(LoopbackClient::new()),
            membership: Arc::new(StaticMembership::new(vec!["self:11800".to_string()])),
            health: None,
        },
    )
    .expect("assemble");
    let ingress = Ingress::new(Arc::clone(&assembly.context), None);
    let server = RemoteServer::new(
        "127.0.0.1:0",
        Arc::clone(&assembly.context),
        Some(ingress.clone()),
        None,
    );
    let addr = server.start().await.expect("start");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/ingest/v1/records"))
        .header("Content-Type", "application/x-ndjson")
        .body("not json\n")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(ingress.received(), 0);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_node_ingests_and_flushes_on_stop() {
    let store = Arc::new(MemoryStore::new());
    let mut node = CollectorNode::with_store(local_config(), store.clone()).expect("node");
    node.start().await.expect("start");
    let addr = node.remote_addr().expect("bound");

    let records = vec![
        Record::new(MetricKind::Service, 100, "A").with_calls(1, 0, 0),
        Record::new(MetricKind::Service, 100, "A").with_calls(1, 0, 0),
        Record::new(MetricKind::Endpoint, 100, "A").with_endpoint("/pay").with_calls(3, 1, 30),
    ];
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/ingest/v1/records"))
        .header("Content-Type", "application/x-ndjson")
        .body(encode_ndjson(&records).expect("encode"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(node.ingress().map(|i| i.received()), Some(3));

    // Well before the first timed flush: only shutdown writes.
    node.stop().await.expect("stop");

    assert_eq!(
        store.lookup("service_minute", "100:A").map(|m| m.measures.calls),
        Some(2)
    );
    let endpoint = store.lookup("endpoint_minute", "100:A:/pay").expect("endpoint");
    assert_eq!(endpoint.measures.errors, 1);
    let metrics = node.health().render().expect("render");
    assert!(metrics.contains("apm_stream_records_received_total 3"));
}
