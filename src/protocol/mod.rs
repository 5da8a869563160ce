//! Wire model: the Envelope message container and its JSON-RPC 2.0 framing.

pub mod envelope;
pub mod jsonrpc;

pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeError, PROTOCOL_VERSION};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, SendParams, METHOD_SEND};
