//! The Envelope: the protocol's immutable message container.
//!
//! An envelope is created once by the sender, validated at construction, and
//! never mutated in transit. Ids are UUIDv7 so they sort lexicographically by
//! creation time; timestamps are normalized to UTC on both ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Current envelope protocol version.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Payload types that answer an earlier envelope and therefore must carry a
/// `correlation_id` pointing at it.
pub const RESPONSE_KINDS: &[&str] = &["task.response", "mcp.tool_result", "mcp.resource_data"];

/// Envelope construction/validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("payload type {payload_type:?} is a response kind and requires correlation_id")]
    MissingCorrelationId { payload_type: String },

    #[error("envelope field {field:?} must not be empty")]
    EmptyField { field: &'static str },

    #[error("unsupported protocol version {version:?}")]
    UnsupportedVersion { version: String },
}

/// The message unit exchanged between agents. Frozen after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub recipient: String,
    pub payload_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Envelope {
    /// Start building an envelope. `id` and `timestamp` are auto-filled.
    pub fn builder(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload_type: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            id: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp: None,
            sender: sender.into(),
            recipient: recipient.into(),
            payload_type: payload_type.into(),
            payload: Map::new(),
            correlation_id: None,
            trace_id: None,
            extensions: None,
        }
    }

    /// Whether this envelope's payload type answers an earlier envelope.
    pub fn is_response_kind(&self) -> bool {
        RESPONSE_KINDS.contains(&self.payload_type.as_str())
    }

    /// Re-check construction invariants on a deserialized (inbound) envelope.
    ///
    /// Returns every violated invariant, not just the first, so the server
    /// can embed the full reason list in an Invalid Params response.
    pub fn validate(&self) -> Result<(), Vec<EnvelopeError>> {
        let mut reasons = Vec::new();
        for (field, value) in [
            ("id", &self.id),
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("payload_type", &self.payload_type),
        ] {
            if value.trim().is_empty() {
                reasons.push(EnvelopeError::EmptyField { field });
            }
        }
        if self.protocol_version.trim().is_empty() {
            reasons.push(EnvelopeError::UnsupportedVersion {
                version: self.protocol_version.clone(),
            });
        }
        if self.is_response_kind() && self.correlation_id.is_none() {
            reasons.push(EnvelopeError::MissingCorrelationId {
                payload_type: self.payload_type.clone(),
            });
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }

    /// Derive a response envelope: sender/recipient swapped, correlated to
    /// this envelope's id, trace id propagated across the causal chain.
    pub fn reply(
        &self,
        payload_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<Envelope, EnvelopeError> {
        Envelope::builder(self.recipient.clone(), self.sender.clone(), payload_type)
            .payload(payload)
            .correlation_id(self.id.clone())
            .maybe_trace_id(self.trace_id.clone())
            .build()
    }
}

/// Builder enforcing construction invariants before an [`Envelope`] exists.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    id: Option<String>,
    protocol_version: String,
    timestamp: Option<DateTime<Utc>>,
    sender: String,
    recipient: String,
    payload_type: String,
    payload: Map<String, Value>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    extensions: Option<Map<String, Value>>,
}

impl EnvelopeBuilder {
    /// Override the auto-generated id. Mostly useful in tests.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the auto-generated timestamp.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Insert a single payload entry.
    pub fn payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn maybe_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Attach a free-form extension entry.
    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Finalize. Fails when a response-kind envelope lacks `correlation_id`
    /// or a mandatory field is empty.
    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        for (field, value) in [
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("payload_type", &self.payload_type),
        ] {
            if value.trim().is_empty() {
                return Err(EnvelopeError::EmptyField { field });
            }
        }
        if RESPONSE_KINDS.contains(&self.payload_type.as_str()) && self.correlation_id.is_none() {
            return Err(EnvelopeError::MissingCorrelationId {
                payload_type: self.payload_type,
            });
        }

        Ok(Envelope {
            id: self.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            protocol_version: self.protocol_version,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            sender: self.sender,
            recipient: self.recipient,
            payload_type: self.payload_type,
            payload: self.payload,
            correlation_id: self.correlation_id,
            trace_id: self.trace_id,
            extensions: self.extensions,
        })
    }
}
