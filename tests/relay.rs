//! End-to-end HTTP relay behaviour through a registry instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_tap::capture::BodyEncoding;
use relay_tap::ProxyRegistry;
use serde_json::Value;
use tokio::sync::mpsc;

mod common;

use common::{client, relay_url};

#[tokio::test]
async fn gzip_response_reaches_client_untouched_and_capture_decoded() {
    const BODY: &str = r#"{"greeting":"hello","items":[1,2,3]}"#;
    let target = common::gzip_backend(BODY).await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let (tx, mut captured) = mpsc::unbounded_channel();
    registry.observers().on_response(move |response| {
        let _ = tx.send(response.clone());
    });
    let port = registry.start("gzip", 0, target).await.unwrap();

    let response = client()
        .get(relay_url(port, "/api/data?x=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), common::gzip(BODY.as_bytes()).as_slice());

    let record = captured.recv().await.unwrap();
    assert_eq!(record.status_code(), 200);
    assert_eq!(record.status_message(), "OK");
    assert_eq!(record.body(), BODY);
    assert_eq!(record.body_encoding(), BodyEncoding::Utf8);
    assert_eq!(record.headers().first("content-encoding"), Some("gzip"));
    assert_eq!(record.request().method(), "GET");
    assert_eq!(record.request().url(), "/api/data?x=1");

    let wire = serde_json::to_value(&record).unwrap();
    assert_eq!(wire["statusCode"], 200);
    assert!(wire.get("bodyEncoding").is_none());
    assert!(wire["duration"].is_u64());

    registry.shutdown().await;
}

#[tokio::test]
async fn request_is_mirrored_without_host() {
    let target = common::echo_backend().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let (tx, mut captured) = mpsc::unbounded_channel();
    registry.observers().on_request(move |request| {
        let _ = tx.send(request.clone());
    });
    let port = registry.start("echo", 0, target).await.unwrap();

    let response = client()
        .post(relay_url(port, "/submit?id=7"))
        .header("x-trace", "one")
        .body("name=relay")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["uri"], "/submit?id=7");
    assert_eq!(echoed["body"], "name=relay");
    assert_eq!(echoed["host"], format!("localhost:{}", target));

    let request = captured.recv().await.unwrap();
    assert_eq!(request.method(), "POST");
    assert_eq!(request.url(), "/submit?id=7");
    assert_eq!(request.body(), "name=relay");
    assert_eq!(request.headers().first("x-trace"), Some("one"));
    assert_eq!(request.ip(), Some("127.0.0.1"));

    registry.shutdown().await;
}

#[tokio::test]
async fn unreachable_backend_yields_proxy_error() {
    let target = common::free_port().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let port = registry.start("down", 0, target).await.unwrap();

    let response = client().get(relay_url(port, "/x")).send().await.unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.headers()["content-type"], "application/json");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Proxy Error");
    assert_eq!(body["code"], "ECONNREFUSED");
    assert_eq!(body["target"], format!("localhost:{}", target));
    assert_eq!(body["url"], "/x");
    assert!(!body["message"].as_str().unwrap().is_empty());

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_backend_times_out_after_deadline() {
    let target = common::silent_backend().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let port = registry.start("slow", 0, target).await.unwrap();

    let started = tokio::time::Instant::now();
    let response = client().get(relay_url(port, "/slow")).send().await.unwrap();
    assert_eq!(response.status(), 504);
    assert!(started.elapsed() >= Duration::from_secs(30));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Gateway Timeout");
    assert_eq!(body["target"], format!("localhost:{}", target));
    assert_eq!(body["url"], "/slow");

    registry.shutdown().await;
}

#[tokio::test]
async fn health_is_answered_without_touching_backend() {
    let (target, accepted) = common::counting_backend().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let port = registry.start("health", 0, target).await.unwrap();

    let response = client().get(relay_url(port, "/_proxy/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["proxy"], "active");
    assert_eq!(body["relayPort"], target.to_string());
    assert!(body.get("webSocketPort").is_none());
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

    let ws_port = registry.start_channel(0).await.unwrap();
    let response = client()
        .post(relay_url(port, "/_proxy/health"))
        .body("ignored")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["webSocketPort"], ws_port);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn response_observer_runs_after_request_observer() {
    let target = common::echo_backend().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&order);
    registry.observers().on_request(move |_| seen.lock().unwrap().push("request"));
    let seen = Arc::clone(&order);
    registry.observers().on_response(move |_| seen.lock().unwrap().push("response"));

    let port = registry.start("order", 0, target).await.unwrap();
    let response = client().get(relay_url(port, "/")).send().await.unwrap();
    response.bytes().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["request", "response"]);
    registry.shutdown().await;
}

#[tokio::test]
async fn replaced_observer_is_the_only_one_called() {
    let target = common::echo_backend().await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let calls = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&calls);
    registry.observers().on_request(move |_| seen.lock().unwrap().push("first"));
    let seen = Arc::clone(&calls);
    registry.observers().on_request(move |_| seen.lock().unwrap().push("second"));

    let port = registry.start("observers", 0, target).await.unwrap();
    client().get(relay_url(port, "/")).send().await.unwrap().bytes().await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["second"]);
    registry.shutdown().await;
}

#[tokio::test]
async fn oversized_request_body_is_rejected_before_forwarding() {
    let (target, accepted) = common::counting_backend().await;
    let mut config = common::loopback_config();
    config.relay.max_request_body_bytes = 16;
    let registry = ProxyRegistry::new(config);
    let port = registry.start("limit", 0, target).await.unwrap();

    let response = client()
        .post(relay_url(port, "/upload"))
        .body(vec![b'a'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Payload Too Large");
    assert_eq!(body["url"], "/upload");
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn backend_failing_mid_body_is_neither_captured_nor_published() {
    let target = common::short_body_backend(b"helloworld", 100).await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let responses = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&responses);
    registry.observers().on_response(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let (_, mut events) = registry.broadcaster().subscribe_channel();
    let port = registry.start("short", 0, target).await.unwrap();

    let response = client().get(relay_url(port, "/partial")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    if let Ok(body) = response.bytes().await {
        assert!(body.len() < 100);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(responses.load(Ordering::SeqCst), 0);

    let mut kinds = Vec::new();
    while let Ok(message) = events.try_recv() {
        let envelope: Value = serde_json::from_str(&message).unwrap();
        kinds.push(envelope["type"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds, vec!["request".to_string()]);

    registry.shutdown().await;
}

#[tokio::test]
async fn client_leaving_mid_stream_still_yields_full_capture() {
    let payload: Arc<str> = "0123456789".repeat(20_000).into();
    let target = common::raw_body_backend(Arc::clone(&payload)).await;
    let registry = ProxyRegistry::new(common::loopback_config());
    let (tx, mut captured) = mpsc::unbounded_channel();
    registry.observers().on_response(move |response| {
        let _ = tx.send(response.clone());
    });
    let port = registry.start("gone", 0, target).await.unwrap();

    let response = client().get(relay_url(port, "/big")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    drop(response);

    let record = tokio::time::timeout(Duration::from_secs(5), captured.recv())
        .await
        .expect("capture after client left")
        .unwrap();
    assert_eq!(record.status_code(), 200);
    assert_eq!(record.body().len(), payload.len());
    assert_eq!(record.body(), &*payload);

    registry.shutdown().await;
}
