//! Axum-based JSON-RPC server for inbound envelopes.
//!
//! Routes:
//! - `POST /asap` — the single JSON-RPC method `asap.send`
//! - `GET /.well-known/asap/manifest.json` — this agent's manifest, with
//!   `ETag` and `Cache-Control` for discovery caching
//! - `GET /asap/stream` — WebSocket envelope streaming, token-bucket paced
//!
//! Body size limits and request timeouts are enforced as tower layers so a
//! slow or oversized request never reaches dispatch. Every failure reachable
//! from a dispatched request answers a well-formed JSON-RPC error response.

pub mod dispatch;
pub mod ws;

use crate::config::Config;
use crate::discovery::AgentManifest;
use crate::error::TransportError;
use crate::protocol::envelope::Envelope;
use crate::protocol::jsonrpc::{
    JsonRpcError, JsonRpcResponse, SendParams, METHOD_SEND, VERSION as JSONRPC_VERSION,
};
use crate::transport::executor::BoundedExecutor;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dispatch::{Dispatcher, HandlerRegistry, LocalContext};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    agent_id: String,
    manifest_json: Arc<str>,
    manifest_etag: Arc<str>,
    manifest_max_age: u64,
    stream_rate: f64,
    stream_burst: f64,
}

/// Inbound façade: owns the dispatcher, bounded executor, and manifest.
pub struct AsapServer {
    state: AppState,
    bind: String,
    max_body_bytes: usize,
    request_timeout: Duration,
}

impl AsapServer {
    /// Build a server from config and a fully-populated handler registry.
    ///
    /// The served manifest advertises the registered payload types as
    /// capabilities and the configured bind address as the RPC endpoint.
    pub fn new(config: &Config, registry: HandlerRegistry) -> anyhow::Result<Self> {
        let max_threads = config
            .server
            .max_sync_threads
            .unwrap_or_else(BoundedExecutor::default_max_threads);
        let executor = Arc::new(BoundedExecutor::new(max_threads)?);
        let manifest = Self::build_manifest(config, &registry);
        Self::with_parts(config, registry, executor, manifest)
    }

    /// Variant for callers supplying their own executor or manifest.
    pub fn with_parts(
        config: &Config,
        registry: HandlerRegistry,
        executor: Arc<BoundedExecutor>,
        manifest: AgentManifest,
    ) -> anyhow::Result<Self> {
        let manifest_json = serde_json::to_string(&manifest)?;
        let manifest_etag = etag_for(&manifest_json);
        let state = AppState {
            dispatcher: Arc::new(Dispatcher::new(registry, executor)),
            agent_id: config.agent.id.clone(),
            manifest_json: manifest_json.into(),
            manifest_etag: manifest_etag.into(),
            manifest_max_age: config.server.manifest_max_age_secs,
            stream_rate: config.server.stream_rate,
            stream_burst: config.server.stream_burst,
        };
        Ok(Self {
            state,
            bind: config.server.bind.clone(),
            max_body_bytes: config.server.max_body_bytes,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        })
    }

    fn build_manifest(config: &Config, registry: &HandlerRegistry) -> AgentManifest {
        AgentManifest {
            agent: config.agent.id.clone(),
            name: config.agent.name.clone(),
            version: config.agent.version.clone(),
            protocol_version: crate::protocol::envelope::PROTOCOL_VERSION.to_string(),
            capabilities: registry.payload_types(),
            endpoints: HashMap::from([(
                "rpc".to_string(),
                format!("http://{}/asap", config.server.bind),
            )]),
            extensions: None,
        }
    }

    /// The route table with body-limit and timeout layers applied.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/asap", post(handle_rpc))
            .route("/.well-known/asap/manifest.json", get(handle_manifest))
            .route("/asap/stream", get(ws::handle_stream))
            .layer(RequestBodyLimitLayer::new(self.max_body_bytes))
            .layer(TimeoutLayer::new(self.request_timeout))
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until the task is cancelled.
    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (tests use an ephemeral port).
    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            agent = %self.state.agent_id,
            "ASAP server listening"
        );
        let router = self.router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

impl HandlerRegistry {
    /// Registered payload types, sorted for a stable manifest.
    pub fn payload_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handler_keys();
        types.sort();
        types
    }
}

/// Strong ETag from the manifest body.
fn etag_for(body: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(body.as_bytes());
    format!("\"{}\"", hex::encode(&digest[..16]))
}

/// POST /asap — parse, validate, dispatch, answer JSON-RPC.
async fn handle_rpc(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return rpc_failure(StatusCode::OK, None, JsonRpcError::parse_error(e.to_string()));
        }
    };

    // The request id is echoed back even when validation fails, as long as
    // it was readable.
    let request_id = parsed
        .get("id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    if parsed.get("jsonrpc").and_then(serde_json::Value::as_str) != Some(JSONRPC_VERSION) {
        return rpc_failure(
            StatusCode::OK,
            request_id,
            JsonRpcError::invalid_request("jsonrpc field must be \"2.0\""),
        );
    }

    let Some(method) = parsed.get("method").and_then(serde_json::Value::as_str) else {
        return rpc_failure(
            StatusCode::OK,
            request_id,
            JsonRpcError::invalid_request("method field missing"),
        );
    };
    if method != METHOD_SEND {
        return rpc_failure(
            StatusCode::OK,
            request_id,
            JsonRpcError::method_not_found(method),
        );
    }

    let params: SendParams =
        match serde_json::from_value(parsed.get("params").cloned().unwrap_or_default()) {
            Ok(params) => params,
            Err(e) => {
                return rpc_failure(
                    StatusCode::OK,
                    request_id,
                    JsonRpcError::invalid_params(vec![format!("malformed params: {e}")]),
                );
            }
        };

    let envelope = params.envelope;
    if let Err(reasons) = envelope.validate() {
        return rpc_failure(
            StatusCode::OK,
            request_id,
            JsonRpcError::invalid_params(reasons.iter().map(ToString::to_string).collect()),
        );
    }

    let ctx = LocalContext {
        agent_id: state.agent_id.clone(),
        peer: Some(peer),
        trace_id: envelope.trace_id.clone(),
    };

    tracing::debug!(
        payload_type = %envelope.payload_type,
        envelope_id = %envelope.id,
        sender = %envelope.sender,
        "Dispatching inbound envelope"
    );

    match state.dispatcher.dispatch(envelope, ctx).await {
        Ok(response_envelope) => {
            let id = request_id.unwrap_or_default();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::success(id, response_envelope)),
            )
                .into_response()
        }
        Err(err) => {
            // Pool exhaustion is the backpressure signal; 503 tells
            // status-aware clients to back off and retry.
            let status = match &err {
                TransportError::ThreadPoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            tracing::warn!(error = %err, kind = err.kind(), "Dispatch failed");
            rpc_failure(status, request_id, err.to_jsonrpc_error())
        }
    }
}

fn rpc_failure(status: StatusCode, id: Option<String>, error: JsonRpcError) -> Response {
    (status, Json(JsonRpcResponse::failure(id, error))).into_response()
}

/// GET /.well-known/asap/manifest.json
async fn handle_manifest(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cache_control = format!("public, max-age={}", state.manifest_max_age);

    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|inm| inm == &*state.manifest_etag);
    if matches {
        return (
            StatusCode::NOT_MODIFIED,
            [
                (header::ETAG, state.manifest_etag.to_string()),
                (header::CACHE_CONTROL, cache_control),
            ],
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::ETAG, state.manifest_etag.to_string()),
            (header::CACHE_CONTROL, cache_control),
        ],
        state.manifest_json.to_string(),
    )
        .into_response()
}

/// Dispatch used by the streaming endpoint; shares the RPC path's dispatcher.
pub(crate) async fn dispatch_stream_envelope(
    state: &AppState,
    envelope: Envelope,
    peer: SocketAddr,
) -> Result<Envelope, TransportError> {
    let ctx = LocalContext {
        agent_id: state.agent_id.clone(),
        peer: Some(peer),
        trace_id: envelope.trace_id.clone(),
    };
    state.dispatcher.dispatch(envelope, ctx).await
}

impl AppState {
    pub(crate) fn stream_bucket(&self) -> crate::transport::bucket::TokenBucket {
        crate::transport::bucket::TokenBucket::new(self.stream_rate, self.stream_burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_and_quoted() {
        let a = etag_for("{\"agent\":\"x\"}");
        let b = etag_for("{\"agent\":\"x\"}");
        let c = etag_for("{\"agent\":\"y\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn manifest_advertises_registered_capabilities() {
        let config = Config::default();
        let mut registry = HandlerRegistry::new();
        registry.register_sync("task.request", |env: Envelope, _| {
            env.reply("task.response", serde_json::Map::new())
                .map_err(TransportError::from)
        });
        registry.register_sync("agent.ping", |env: Envelope, _| {
            env.reply("task.response", serde_json::Map::new())
                .map_err(TransportError::from)
        });

        let manifest = AsapServer::build_manifest(&config, &registry);
        assert_eq!(manifest.capabilities, vec!["agent.ping", "task.request"]);
        assert_eq!(manifest.agent, config.agent.id);
        assert!(manifest.endpoints["rpc"].ends_with("/asap"));
    }
}
