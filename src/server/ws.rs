//! WebSocket envelope streaming.
//!
//! Each connection carries a stream of JSON envelope frames and gets its own
//! token bucket. A frame arriving with the bucket empty is answered with a
//! `rate_limited` error frame and never dispatched; the sender keeps the
//! connection and can retry after backing off.

use super::{dispatch_stream_envelope, AppState};
use crate::error::TransportError;
use crate::protocol::envelope::Envelope;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Outbound frame on the stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// A handler's response envelope.
    Envelope { envelope: Envelope },
    /// A frame-level failure; the connection stays open.
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

pub(crate) async fn handle_stream(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let mut bucket = state.stream_bucket();
    tracing::debug!(peer = %peer, "Stream connection opened");

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by axum; ignore everything else.
            Ok(_) => continue,
        };

        let frame = if bucket.consume(1.0) {
            process_frame(&state, text.as_str(), peer).await
        } else {
            tracing::debug!(peer = %peer, "Stream frame rejected - rate limited");
            StreamFrame::Error {
                kind: "rate_limited".to_string(),
                message: "stream message budget exhausted".to_string(),
                retry_after_ms: Some(1_000),
            }
        };

        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode stream frame");
                break;
            }
        };
        if sender.send(Message::Text(encoded.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!(peer = %peer, "Stream connection closed");
}

/// Decode, validate, and dispatch one inbound envelope frame.
async fn process_frame(state: &AppState, raw: &str, peer: SocketAddr) -> StreamFrame {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return StreamFrame::Error {
                kind: "envelope_invalid".to_string(),
                message: format!("malformed envelope frame: {e}"),
                retry_after_ms: None,
            };
        }
    };

    if let Err(reasons) = envelope.validate() {
        let detail: Vec<String> = reasons.iter().map(ToString::to_string).collect();
        return StreamFrame::Error {
            kind: "envelope_invalid".to_string(),
            message: detail.join("; "),
            retry_after_ms: None,
        };
    }

    match dispatch_stream_envelope(state, envelope, peer).await {
        Ok(envelope) => StreamFrame::Envelope { envelope },
        Err(err) => {
            let retry_after_ms = match &err {
                TransportError::ThreadPoolExhausted { .. } => Some(100),
                _ => None,
            };
            StreamFrame::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
                retry_after_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_tag_their_variant() {
        let frame = StreamFrame::Error {
            kind: "rate_limited".to_string(),
            message: "slow down".to_string(),
            retry_after_ms: Some(1_000),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "rate_limited");
        assert_eq!(value["retry_after_ms"], 1_000);
    }

    #[test]
    fn envelope_frame_round_trips() {
        let envelope = Envelope::builder("urn:asap:a", "urn:asap:b", "task.request")
            .build()
            .unwrap();
        let frame = StreamFrame::Envelope {
            envelope: envelope.clone(),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        match serde_json::from_str::<StreamFrame>(&encoded).unwrap() {
            StreamFrame::Envelope { envelope: decoded } => assert_eq!(decoded.id, envelope.id),
            other => panic!("expected envelope frame, got {other:?}"),
        }
    }
}
