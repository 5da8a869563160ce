//! JSON-RPC 2.0 framing for envelope transport.
//!
//! The protocol has exactly one method, `asap.send`. Anything else answers
//! Method Not Found. Application-level failures are distinguished by a
//! string `kind` tag in `error.data` rather than by vendor codes, so peers
//! can branch on kind without hardcoding numbers.

use crate::protocol::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only RPC method this transport speaks.
pub const METHOD_SEND: &str = "asap.send";

/// Fixed `jsonrpc` field value.
pub const VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 codes plus positive application codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const APP_HANDLER_NOT_FOUND: i64 = 1001;
    pub const APP_THREAD_POOL_EXHAUSTED: i64 = 1002;
    pub const APP_CIRCUIT_OPEN: i64 = 1003;
    pub const APP_MANIFEST_VALIDATION_FAILED: i64 = 1004;
}

/// Stable `error.data.kind` tags.
pub mod kinds {
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const THREAD_POOL_EXHAUSTED: &str = "thread_pool_exhausted";
    pub const HANDLER_NOT_FOUND: &str = "handler_not_found";
    pub const MANIFEST_VALIDATION_FAILED: &str = "manifest_validation_failed";
    pub const ENVELOPE_INVALID: &str = "envelope_invalid";
}

/// Parameters of `asap.send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendParams {
    pub envelope: Envelope,
    /// Caller-supplied key for at-most-once semantics on the receiving side.
    pub idempotency_key: String,
}

/// A JSON-RPC 2.0 request carrying one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: SendParams,
    pub id: String,
}

impl JsonRpcRequest {
    /// Frame an envelope for the wire. The idempotency key reuses the
    /// envelope id, which is unique per message by construction.
    pub fn send(envelope: Envelope) -> Self {
        let id = format!("req-{}", envelope.id);
        Self {
            jsonrpc: VERSION.to_string(),
            method: METHOD_SEND.to_string(),
            params: SendParams {
                idempotency_key: envelope.id.clone(),
                envelope,
            },
            id,
        }
    }
}

/// Successful `asap.send` result: the response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub envelope: Envelope,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self {
            code: codes::PARSE_ERROR,
            message: "Parse error".to_string(),
            data: Some(serde_json::json!({ "detail": detail.into() })),
        }
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self {
            code: codes::INVALID_REQUEST,
            message: "Invalid Request".to_string(),
            data: Some(serde_json::json!({ "detail": detail.into() })),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: codes::METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: Some(serde_json::json!({ "method": method })),
        }
    }

    /// Invalid Params with the envelope validation failure reasons embedded
    /// in `error.data.reasons`.
    pub fn invalid_params(reasons: Vec<String>) -> Self {
        Self {
            code: codes::INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(serde_json::json!({
                "kind": kinds::ENVELOPE_INVALID,
                "reasons": reasons,
            })),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            code: codes::INTERNAL_ERROR,
            message: "Internal error".to_string(),
            data: Some(serde_json::json!({ "detail": detail.into() })),
        }
    }

    /// Positive application code with a `kind` tag merged into `data`.
    pub fn application(code: i64, message: String, kind: &str, data: Value) -> Self {
        let mut data = data;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("kind".to_string(), Value::String(kind.to_string()));
        }
        Self {
            code,
            message,
            data: Some(data),
        }
    }

    /// Extract the `kind` tag, if the error carries one.
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

/// A JSON-RPC 2.0 response: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SendResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Mirrors the request id; null when the request id was unreadable.
    pub id: Option<String>,
}

impl JsonRpcResponse {
    pub fn success(id: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(SendResult { envelope }),
            error: None,
            id: Some(id.into()),
        }
    }

    pub fn failure(id: Option<String>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}
