//! Transport error taxonomy.
//!
//! Errors are split into retryable (transient network/peer failures) and
//! non-retryable (permanent routing or shape defects). The distinction drives
//! the retry engine: retryable failures consume retry budget and count
//! against the circuit breaker, everything else propagates immediately.

use crate::protocol::envelope::EnvelopeError;
use crate::protocol::jsonrpc::{self, JsonRpcError};
use std::time::Duration;
use thiserror::Error;

/// Typed failure surface of the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport-level failure: DNS, connection refused, reset mid-flight.
    #[error("connection to {target} failed: {detail}")]
    Connection { target: String, detail: String },

    /// Per-attempt or per-call deadline exceeded.
    #[error("request to {target} timed out after {elapsed:?}")]
    Timeout { target: String, elapsed: Duration },

    /// The peer answered with a JSON-RPC error object.
    #[error("peer returned JSON-RPC error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        /// String tag from `error.data.kind`, when the peer provided one.
        kind: Option<String>,
        /// Wait hint from a `Retry-After` header or error payload.
        retry_after: Option<Duration>,
    },

    /// Fast-fail from an open circuit breaker. Not retried: it is the signal
    /// that retries are currently futile.
    #[error("circuit open for {target}; retry after {retry_after:?}")]
    CircuitOpen {
        target: String,
        retry_after: Duration,
    },

    /// Server-side admission rejection: the bounded executor is saturated.
    #[error("handler pool exhausted: {active} of {max_threads} workers busy")]
    ThreadPoolExhausted { max_threads: usize, active: usize },

    /// No handler registered for the envelope's payload type. A routing
    /// defect, never retried.
    #[error("no handler registered for payload type {payload_type:?}")]
    HandlerNotFound { payload_type: String },

    /// Malformed envelope shape. Never retried.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A discovered manifest failed validation.
    #[error("manifest from {url} failed validation: {reason}")]
    ManifestInvalid { url: String, reason: String },

    /// Handler crashed or the dispatch machinery failed internally.
    #[error("internal dispatch failure: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether the retry engine may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::ThreadPoolExhausted { .. } => {
                true
            }
            Self::Remote { code, kind, .. } => {
                *code == jsonrpc::codes::INTERNAL_ERROR
                    || matches!(
                        kind.as_deref(),
                        Some(jsonrpc::kinds::THREAD_POOL_EXHAUSTED | jsonrpc::kinds::CIRCUIT_OPEN)
                    )
            }
            Self::CircuitOpen { .. }
            | Self::HandlerNotFound { .. }
            | Self::Envelope(_)
            | Self::ManifestInvalid { .. }
            | Self::Internal(_) => false,
        }
    }

    /// Stable string tag carried in `error.data.kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Remote { .. } => "remote",
            Self::CircuitOpen { .. } => jsonrpc::kinds::CIRCUIT_OPEN,
            Self::ThreadPoolExhausted { .. } => jsonrpc::kinds::THREAD_POOL_EXHAUSTED,
            Self::HandlerNotFound { .. } => jsonrpc::kinds::HANDLER_NOT_FOUND,
            Self::Envelope(_) => jsonrpc::kinds::ENVELOPE_INVALID,
            Self::ManifestInvalid { .. } => jsonrpc::kinds::MANIFEST_VALIDATION_FAILED,
            Self::Internal(_) => "internal",
        }
    }

    /// Map a dispatch failure to the wire error object the server returns.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            Self::HandlerNotFound { payload_type } => JsonRpcError::application(
                jsonrpc::codes::APP_HANDLER_NOT_FOUND,
                format!("no handler registered for {payload_type:?}"),
                jsonrpc::kinds::HANDLER_NOT_FOUND,
                serde_json::json!({ "payload_type": payload_type }),
            ),
            Self::ThreadPoolExhausted {
                max_threads,
                active,
            } => JsonRpcError::application(
                jsonrpc::codes::APP_THREAD_POOL_EXHAUSTED,
                "handler pool exhausted; retry later".to_string(),
                jsonrpc::kinds::THREAD_POOL_EXHAUSTED,
                serde_json::json!({ "max_threads": max_threads, "active": active }),
            ),
            Self::CircuitOpen {
                target,
                retry_after,
            } => JsonRpcError::application(
                jsonrpc::codes::APP_CIRCUIT_OPEN,
                format!("circuit open for {target}"),
                jsonrpc::kinds::CIRCUIT_OPEN,
                serde_json::json!({ "retry_after_ms": retry_after.as_millis() as u64 }),
            ),
            Self::Envelope(err) => JsonRpcError::invalid_params(vec![err.to_string()]),
            Self::ManifestInvalid { url, reason } => JsonRpcError::application(
                jsonrpc::codes::APP_MANIFEST_VALIDATION_FAILED,
                format!("manifest from {url} failed validation"),
                jsonrpc::kinds::MANIFEST_VALIDATION_FAILED,
                serde_json::json!({ "reason": reason }),
            ),
            other => JsonRpcError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_timeout_are_retryable() {
        let conn = TransportError::Connection {
            target: "http://a".into(),
            detail: "refused".into(),
        };
        let timeout = TransportError::Timeout {
            target: "http://a".into(),
            elapsed: Duration::from_secs(30),
        };
        assert!(conn.is_retryable());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn remote_internal_error_is_retryable() {
        let err = TransportError::Remote {
            code: jsonrpc::codes::INTERNAL_ERROR,
            message: "boom".into(),
            kind: None,
            retry_after: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn remote_pool_exhaustion_is_retryable_by_kind() {
        let err = TransportError::Remote {
            code: jsonrpc::codes::APP_THREAD_POOL_EXHAUSTED,
            message: "busy".into(),
            kind: Some(jsonrpc::kinds::THREAD_POOL_EXHAUSTED.into()),
            retry_after: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn routing_and_shape_defects_are_fatal() {
        let not_found = TransportError::HandlerNotFound {
            payload_type: "task.request".into(),
        };
        let invalid_params = TransportError::Remote {
            code: jsonrpc::codes::INVALID_PARAMS,
            message: "bad envelope".into(),
            kind: None,
            retry_after: None,
        };
        assert!(!not_found.is_retryable());
        assert!(!invalid_params.is_retryable());
    }

    #[test]
    fn circuit_open_is_not_retryable_by_the_engine() {
        let err = TransportError::CircuitOpen {
            target: "http://a".into(),
            retry_after: Duration::from_secs(60),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn wire_mapping_tags_kind_in_data() {
        let err = TransportError::HandlerNotFound {
            payload_type: "x".into(),
        };
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc.code, jsonrpc::codes::APP_HANDLER_NOT_FOUND);
        let data = rpc.data.expect("data present");
        assert_eq!(data["kind"], "handler_not_found");
    }
}
