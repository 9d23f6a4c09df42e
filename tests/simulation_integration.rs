//! End-to-end simulation scenarios against stubbed HTTP targets

use fleetsim::config::{LogStreamConfig, SimulatorConfig};
use fleetsim::engine::SimulationEngine;
use fleetsim::log_stream::EventType;
use fleetsim::metrics::MetricsCollector;
use fleetsim::model::{
    DeviceDescriptor, PayloadDescriptor, ProjectDescriptor, TargetDescriptor,
};
use fleetsim::store::InMemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixed_schema_payload(id: &str) -> PayloadDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "name": "telemetry",
        "kind": "schema",
        "schema": {"fields": [
            {"name": "t", "type": "number", "generator": {"type": "fixed", "value": 42}}
        ]}
    }))
    .unwrap()
}

fn http_target(id: &str, url: &str) -> TargetDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "name": "ingest",
        "kind": "http",
        "config": {"url": url, "method": "POST", "timeout": 5}
    }))
    .unwrap()
}

fn device(id: &str, project: &str, payload: &str, target: &str, interval: u64) -> DeviceDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("device-{id}"),
        "project_id": project,
        "payload_ref": payload,
        "target_ref": target,
        "send_interval_secs": interval
    }))
    .unwrap()
}

fn project(id: &str) -> ProjectDescriptor {
    serde_json::from_value(json!({"id": id, "name": format!("project-{id}")})).unwrap()
}

fn build_engine(store: InMemoryStore, retry_delay_ms: u64) -> SimulationEngine {
    SimulationEngine::new(
        Arc::new(store),
        Arc::new(MetricsCollector::default()),
        SimulatorConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(retry_delay_ms),
            max_consecutive_errors: 10,
        },
        LogStreamConfig::default(),
    )
}

#[tokio::test]
async fn happy_path_schema_payload_http_target() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut store = InMemoryStore::new();
    store.insert_project(project("p1"));
    store.insert_payload(fixed_schema_payload("pl1"));
    store.insert_target(http_target("t1", &format!("{}/ingest", server.uri())));
    store.insert_device(device("d1", "p1", "pl1", "t1", 1));

    let engine = build_engine(store, 100);
    assert_eq!(engine.start_project("p1").await.unwrap(), 1);

    // Interval 1 s: at least two ticks complete within three seconds
    tokio::time::sleep(Duration::from_millis(2600)).await;
    let status = engine.status("p1").await.unwrap();
    engine.stop_project("p1").await.unwrap();

    assert!(status.is_running);
    assert!(status.messages_sent >= 2, "sent {}", status.messages_sent);
    let device_status = &status.devices[0];
    assert_eq!(device_status.errors, 0);
    assert_eq!(device_status.consecutive_errors, 0);
    assert!(device_status.last_success_at.is_some());

    // Every delivered body carries the schema field, device identity and a
    // timestamp stamp
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2);
    for request in &requests {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["t"], json!(42));
        assert_eq!(body["device_id"], json!("d1"));
        assert_eq!(body["device_name"], json!("device-d1"));
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }
}

#[tokio::test]
async fn transient_failure_then_recovery_counts_retries() {
    let server = MockServer::start().await;
    // First two requests fail with 500, everything after succeeds
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut store = InMemoryStore::new();
    store.insert_project(project("p1"));
    store.insert_payload(fixed_schema_payload("pl1"));
    store.insert_target(http_target("t1", &format!("{}/ingest", server.uri())));
    store.insert_device(device("d1", "p1", "pl1", "t1", 60));

    let engine = build_engine(store, 100);
    engine.start_project("p1").await.unwrap();

    // First tick: attempts at ~0 ms, ~100 ms, ~300 ms; third succeeds
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = engine.status("p1").await.unwrap();
    engine.stop_project("p1").await.unwrap();

    let device_status = &status.devices[0];
    assert_eq!(device_status.messages_sent, 1);
    assert_eq!(device_status.total_retries, 2);
    assert_eq!(device_status.consecutive_errors, 0);
    assert!(device_status.is_running || status.messages_sent == 1);
}

#[tokio::test]
async fn start_fails_when_only_device_has_rejected_script() {
    let mut store = InMemoryStore::new();
    store.insert_project(project("p1"));
    store.insert_payload(
        serde_json::from_value(json!({
            "id": "pl-script",
            "name": "forbidden",
            "kind": "script",
            "script": "import os\nresult = #{x: 1};"
        }))
        .unwrap(),
    );
    store.insert_target(http_target("t1", "http://127.0.0.1:1/ingest"));
    store.insert_device(device("d1", "p1", "pl-script", "t1", 1));

    let engine = build_engine(store, 100);
    let err = engine.start_project("p1").await.unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_INVALID");
    assert!(engine.running_project_ids().await.is_empty());
}

#[tokio::test]
async fn emergency_stop_halts_every_project() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut store = InMemoryStore::new();
    for p in ["p1", "p2", "p3"] {
        store.insert_project(project(p));
        for n in 0..5 {
            store.insert_device(device(
                &format!("{p}-d{n}"),
                p,
                "pl1",
                "t1",
                60,
            ));
        }
    }
    store.insert_payload(fixed_schema_payload("pl1"));
    store.insert_target(http_target("t1", &format!("{}/ingest", server.uri())));

    let engine = build_engine(store, 100);
    for p in ["p1", "p2", "p3"] {
        assert_eq!(engine.start_project(p).await.unwrap(), 5);
    }

    let mut stopped = tokio::time::timeout(Duration::from_secs(20), engine.emergency_stop_all())
        .await
        .expect("emergency stop must finish in bounded time");
    stopped.sort();
    assert_eq!(stopped, vec!["p1", "p2", "p3"]);
    assert!(engine.running_project_ids().await.is_empty());

    for p in ["p1", "p2", "p3"] {
        let status = engine.status(p).await.unwrap();
        assert!(!status.is_running);
        assert!(status.devices.is_empty());
    }
}

#[tokio::test]
async fn log_subscriber_gets_ack_replay_then_live_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut store = InMemoryStore::new();
    store.insert_project(project("p1"));
    store.insert_payload(fixed_schema_payload("pl1"));
    store.insert_target(http_target("t1", &format!("{}/ingest", server.uri())));
    store.insert_device(device("d1", "p1", "pl1", "t1", 1));

    let engine = build_engine(store, 100);
    engine.start_project("p1").await.unwrap();

    // Let some history accumulate before subscribing
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let bundle = engine.subscribe_logs("p1").await.expect("project running");
    assert_eq!(bundle.ack.event_type, EventType::ConnectionEstablished);
    assert_eq!(bundle.ack.device_id, "system");
    assert_eq!(bundle.ack.project_id.as_deref(), Some("p1"));

    // Replay is chronological: started first, at most 20 entries
    let replay = &bundle.subscription.replay;
    assert!(!replay.is_empty());
    assert!(replay.len() <= 20);
    assert_eq!(replay[0].event_type, EventType::Started);
    for window in replay.windows(2) {
        assert!(window[0].timestamp <= window[1].timestamp);
    }
    assert!(replay
        .iter()
        .any(|e| e.event_type == EventType::MessageSent));

    // Live entries continue in order after the replay
    let mut receiver = bundle.subscription.receiver;
    let live = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("live entry within five seconds")
        .expect("stream open");
    assert!(replay.last().unwrap().timestamp <= live.timestamp);

    engine.stop_project("p1").await.unwrap();
}

#[tokio::test]
async fn subscriber_on_idle_project_is_informed() {
    let engine = build_engine(InMemoryStore::new(), 100);
    assert!(engine.subscribe_logs("nope").await.is_none());
}
