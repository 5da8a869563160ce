//! Outbound call façade: send-with-resilience and peer discovery.
//!
//! Every send consults the shared per-target circuit breaker before touching
//! the network, retries transient failures with exponential backoff, and
//! reports each terminal outcome back to the breaker.

use crate::config::ClientConfig;
use crate::discovery::{fetch_manifest, AgentManifest, ManifestCache, MANIFEST_PATH};
use crate::error::TransportError;
use crate::protocol::envelope::{Envelope, EnvelopeBuilder};
use crate::protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::transport::backoff::{run_with_retry, AttemptOutcome, RetryPolicy};
use crate::transport::breaker::BreakerRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client for calling remote agents over the JSON-RPC transport.
///
/// Cheap to construct; the breaker registry and manifest cache are shared
/// process-wide singletons injected by the application root, so unrelated
/// client instances pointed at the same target share failure state.
pub struct AsapClient {
    http: reqwest::Client,
    agent_id: String,
    breakers: Arc<BreakerRegistry>,
    manifests: Arc<ManifestCache>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl AsapClient {
    pub fn new(
        agent_id: impl Into<String>,
        config: &ClientConfig,
        breakers: Arc<BreakerRegistry>,
        manifests: Arc<ManifestCache>,
    ) -> anyhow::Result<Self> {
        let request_timeout = config.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            agent_id: agent_id.into(),
            breakers,
            manifests,
            retry: config.retry_policy(),
            request_timeout,
        })
    }

    /// Start an envelope addressed from this agent.
    pub fn envelope(
        &self,
        recipient: impl Into<String>,
        payload_type: impl Into<String>,
    ) -> EnvelopeBuilder {
        Envelope::builder(self.agent_id.clone(), recipient, payload_type)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Send an envelope to the agent at `base_url` and await its response
    /// envelope. Applies circuit breaking, retries, and backoff; always
    /// returns a typed error, never a malformed envelope.
    pub async fn send(
        &self,
        base_url: &str,
        envelope: Envelope,
    ) -> Result<Envelope, TransportError> {
        if let Err(mut reasons) = envelope.validate() {
            // Outbound envelopes are validated at build time; this guards
            // envelopes deserialized from elsewhere.
            return Err(TransportError::Envelope(reasons.remove(0)));
        }

        let request = JsonRpcRequest::send(envelope);
        let body: Arc<[u8]> = serde_json::to_vec(&request)
            .map_err(|e| TransportError::Internal(format!("request serialization: {e}")))?
            .into();
        let url = format!("{}/asap", base_url.trim_end_matches('/'));
        let breaker = self.breakers.breaker_for(base_url);

        run_with_retry(&self.retry, &breaker, base_url, |_attempt| {
            let http = self.http.clone();
            let url = url.clone();
            let target = base_url.to_string();
            let body = Arc::clone(&body);
            let timeout = self.request_timeout;
            async move { attempt_send(&http, &url, &target, &body, timeout).await }
        })
        .await
    }

    /// [`send`](Self::send) bounded by an overall deadline spanning all
    /// attempts. Exceeding it surfaces a timeout and counts as one breaker
    /// failure.
    pub async fn send_with_deadline(
        &self,
        base_url: &str,
        envelope: Envelope,
        deadline: Duration,
    ) -> Result<Envelope, TransportError> {
        match tokio::time::timeout(deadline, self.send(base_url, envelope)).await {
            Ok(result) => result,
            Err(_) => {
                self.breakers.breaker_for(base_url).record_failure();
                tracing::warn!(target = base_url, deadline = ?deadline, "Call deadline exceeded");
                Err(TransportError::Timeout {
                    target: base_url.to_string(),
                    elapsed: deadline,
                })
            }
        }
    }

    /// Resolve the manifest of the agent at `base_url`, consulting the
    /// shared cache first. The peer's `Cache-Control: max-age` sets the TTL
    /// when present.
    pub async fn discover(&self, base_url: &str) -> Result<AgentManifest, TransportError> {
        let key = format!("{}{}", base_url.trim_end_matches('/'), MANIFEST_PATH);
        if let Some(cached) = self.manifests.get(&key) {
            tracing::debug!(url = %key, "Manifest cache hit");
            return Ok(cached);
        }

        let (manifest, ttl) = fetch_manifest(&self.http, base_url).await?;
        self.manifests.set(&key, manifest.clone(), ttl);
        tracing::info!(url = %key, agent = %manifest.agent, ttl = ?ttl, "Discovered peer manifest");
        Ok(manifest)
    }

    /// Drop a cached manifest, forcing the next `discover` to refetch.
    pub fn invalidate_manifest(&self, base_url: &str) {
        let key = format!("{}{}", base_url.trim_end_matches('/'), MANIFEST_PATH);
        self.manifests.invalidate(&key);
    }
}

/// One network attempt: POST, classify the outcome.
async fn attempt_send(
    http: &reqwest::Client,
    url: &str,
    target: &str,
    body: &Arc<[u8]>,
    timeout: Duration,
) -> AttemptOutcome<Envelope> {
    let started = Instant::now();
    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.to_vec())
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return AttemptOutcome::Retryable(TransportError::Timeout {
                target: target.to_string(),
                elapsed: started.elapsed().max(timeout),
            });
        }
        Err(e) => {
            return AttemptOutcome::Retryable(TransportError::Connection {
                target: target.to_string(),
                detail: e.to_string(),
            });
        }
    };

    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AttemptOutcome::Retryable(TransportError::Connection {
                target: target.to_string(),
                detail: format!("reading response body: {e}"),
            });
        }
    };

    // The server answers JSON-RPC bodies even on non-200 statuses
    // (e.g. 503 for pool exhaustion), so try the body first.
    if let Ok(parsed) = serde_json::from_slice::<JsonRpcResponse>(&bytes) {
        if let Some(result) = parsed.result {
            return AttemptOutcome::Success(result.envelope);
        }
        if let Some(error) = parsed.error {
            let transport_err = remote_error(error, retry_after);
            return if transport_err.is_retryable() {
                AttemptOutcome::Retryable(transport_err)
            } else {
                AttemptOutcome::Fatal(transport_err)
            };
        }
    }

    // No JSON-RPC body: fall back to HTTP status classification.
    let err = TransportError::Remote {
        code: i64::from(status.as_u16()),
        message: format!("HTTP {status} without JSON-RPC body"),
        kind: None,
        retry_after,
    };
    if status.as_u16() == 429 || status.is_server_error() {
        AttemptOutcome::Retryable(err)
    } else {
        AttemptOutcome::Fatal(err)
    }
}

/// Lift a JSON-RPC error object into the transport taxonomy.
fn remote_error(error: JsonRpcError, retry_after: Option<Duration>) -> TransportError {
    match error.kind() {
        Some("handler_not_found") => TransportError::HandlerNotFound {
            payload_type: error
                .data
                .as_ref()
                .and_then(|d| d.get("payload_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        },
        _ => {
            let hint = error
                .data
                .as_ref()
                .and_then(|d| d.get("retry_after_ms"))
                .and_then(serde_json::Value::as_u64)
                .map(Duration::from_millis);
            TransportError::Remote {
                code: error.code,
                kind: error.kind().map(str::to_string),
                message: error.message,
                retry_after: hint.or(retry_after),
            }
        }
    }
}

/// `Retry-After` in whole seconds, per the rate-limit collaborator contract.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
