//! Client-side resilience against a mocked peer: retries, Retry-After,
//! fatal short-circuits, breaker sharing, deadlines, and discovery caching.

use asap::client::AsapClient;
use asap::config::ClientConfig;
use asap::discovery::ManifestCache;
use asap::error::TransportError;
use asap::protocol::envelope::Envelope;
use asap::protocol::jsonrpc::{codes, JsonRpcError, JsonRpcResponse};
use asap::transport::breaker::{BreakerConfig, BreakerRegistry};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client_config(max_retries: u32) -> ClientConfig {
    ClientConfig {
        max_retries,
        base_delay_secs: 0.0,
        max_delay_secs: 0.0,
        jitter: false,
        request_timeout_secs: 5,
    }
}

fn registry(failure_threshold: u32) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold,
        open_timeout: Duration::from_secs(60),
    }))
}

fn cache() -> Arc<ManifestCache> {
    Arc::new(ManifestCache::new(16, Duration::from_secs(300)))
}

fn client(max_retries: u32, breakers: Arc<BreakerRegistry>) -> AsapClient {
    AsapClient::new(
        "urn:asap:agent:caller",
        &fast_client_config(max_retries),
        breakers,
        cache(),
    )
    .unwrap()
}

fn success_body() -> JsonRpcResponse {
    let envelope = Envelope::builder("urn:asap:agent:peer", "urn:asap:agent:caller", "task.response")
        .correlation_id("parent")
        .build()
        .unwrap();
    JsonRpcResponse::success("req-1", envelope)
}

fn request(client: &AsapClient) -> Envelope {
    client
        .envelope("urn:asap:agent:peer", "task.request")
        .payload_entry("task", serde_json::json!("summarize"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn recovers_after_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let breakers = registry(10);
    let client = client(3, Arc::clone(&breakers));
    let response = client.send(&server.uri(), request(&client)).await.unwrap();

    assert_eq!(response.payload_type, "task.response");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    // Recovery reset the breaker streak.
    assert_eq!(breakers.breaker_for(&server.uri()).consecutive_failures(), 0);
}

#[tokio::test]
async fn honors_retry_after_on_429_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let client = client(2, registry(10));
    let response = client.send(&server.uri(), request(&client)).await.unwrap();

    assert_eq!(response.payload_type, "task.response");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn fatal_remote_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(JsonRpcResponse::failure(
            Some("req-1".to_string()),
            JsonRpcError::invalid_params(vec!["sender must not be empty".to_string()]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let breakers = registry(10);
    let client = client(5, Arc::clone(&breakers));
    let err = client
        .send(&server.uri(), request(&client))
        .await
        .unwrap_err();

    match err {
        TransportError::Remote { code, .. } => assert_eq!(code, codes::INVALID_PARAMS),
        other => panic!("expected Remote, got {other:?}"),
    }
    // A fatal outcome never touches the breaker.
    assert_eq!(breakers.breaker_for(&server.uri()).consecutive_failures(), 0);
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client(2, registry(100));
    let err = client
        .send(&server.uri(), request(&client))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Remote { code: 500, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn breaker_opened_by_one_client_blocks_a_fresh_client() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let breakers = registry(2);
    let first = client(1, Arc::clone(&breakers));
    let err = first
        .send(&server.uri(), request(&first))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Remote { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // A brand-new client sharing the registry is refused before the network.
    let second = client(5, Arc::clone(&breakers));
    let err = second
        .send(&server.uri(), request(&second))
        .await
        .unwrap_err();
    match err {
        TransportError::CircuitOpen { retry_after, .. } => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn connection_refused_opens_the_shared_breaker() {
    // Bind then drop to get a port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let breakers = registry(2);
    let first = client(1, Arc::clone(&breakers));
    let err = first.send(&target, request(&first)).await.unwrap_err();
    assert!(matches!(err, TransportError::Connection { .. }));

    let second = client(5, Arc::clone(&breakers));
    let err = second.send(&target, request(&second)).await.unwrap_err();
    assert!(matches!(err, TransportError::CircuitOpen { .. }));
}

#[tokio::test]
async fn deadline_cuts_the_call_and_counts_one_breaker_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/asap"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(success_body())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let breakers = registry(10);
    let client = client(0, Arc::clone(&breakers));
    let err = client
        .send_with_deadline(&server.uri(), request(&client), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout { .. }));
    assert_eq!(breakers.breaker_for(&server.uri()).consecutive_failures(), 1);
}

#[tokio::test]
async fn invalid_outbound_envelope_never_hits_the_network() {
    let server = MockServer::start().await;
    let client = client(3, registry(10));

    let mut envelope = request(&client);
    envelope.sender = String::new();
    let err = client.send(&server.uri(), envelope).await.unwrap_err();

    assert!(matches!(err, TransportError::Envelope(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn discovery_caches_until_invalidated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/asap/manifest.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "public, max-age=300")
                .set_body_json(serde_json::json!({
                    "agent": "urn:asap:agent:peer",
                    "name": "peer-service",
                    "version": "1.0.0",
                    "protocol_version": "0.1",
                    "capabilities": ["task.request"],
                    "endpoints": { "rpc": format!("{}/asap", server.uri()) },
                })),
        )
        .mount(&server)
        .await;

    let client = client(0, registry(10));
    let first = client.discover(&server.uri()).await.unwrap();
    let second = client.discover(&server.uri()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    client.invalidate_manifest(&server.uri());
    client.discover(&server.uri()).await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn discovery_rejects_a_manifest_with_blank_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/asap/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "agent": "",
            "name": "peer-service",
            "version": "1.0.0",
            "protocol_version": "0.1",
        })))
        .mount(&server)
        .await;

    let client = client(0, registry(10));
    let err = client.discover(&server.uri()).await.unwrap_err();
    assert!(matches!(err, TransportError::ManifestInvalid { .. }));
}
