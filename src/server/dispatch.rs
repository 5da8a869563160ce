//! Handler registry and dispatch.
//!
//! Handlers are keyed by the envelope's `payload_type` discriminator. The
//! registry is built once at startup and immutable afterwards. Async
//! handlers run on the event loop; synchronous handlers are routed through
//! the bounded executor so one slow handler cannot stall the runtime.

use crate::error::TransportError;
use crate::protocol::envelope::Envelope;
use crate::transport::executor::BoundedExecutor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Per-dispatch context handed to every handler.
#[derive(Debug, Clone)]
pub struct LocalContext {
    /// Identity of the agent doing the dispatching.
    pub agent_id: String,
    /// Remote peer address, when the transport knows it.
    pub peer: Option<SocketAddr>,
    /// Trace id propagated from the inbound envelope.
    pub trace_id: Option<String>,
}

/// An asynchronous envelope handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: LocalContext,
    ) -> Result<Envelope, TransportError>;
}

/// A synchronous handler, executed on the bounded pool.
pub type SyncHandlerFn =
    dyn Fn(Envelope, LocalContext) -> Result<Envelope, TransportError> + Send + Sync;

enum Registered {
    Async(Arc<dyn Handler>),
    Sync(Arc<SyncHandlerFn>),
}

/// Map from payload type to handler. Last registration for a type wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registered>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for a payload type.
    pub fn register(&mut self, payload_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let payload_type = payload_type.into();
        tracing::debug!(payload_type = %payload_type, "Registered async handler");
        self.handlers.insert(payload_type, Registered::Async(handler));
    }

    /// Register a synchronous handler; it will run on the bounded executor.
    pub fn register_sync<F>(&mut self, payload_type: impl Into<String>, handler: F)
    where
        F: Fn(Envelope, LocalContext) -> Result<Envelope, TransportError> + Send + Sync + 'static,
    {
        let payload_type = payload_type.into();
        tracing::debug!(payload_type = %payload_type, "Registered sync handler");
        self.handlers
            .insert(payload_type, Registered::Sync(Arc::new(handler)));
    }

    pub fn contains(&self, payload_type: &str) -> bool {
        self.handlers.contains_key(payload_type)
    }

    /// Registered payload types, in map order.
    pub(crate) fn handler_keys(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Routes envelopes to their handler, admission-controlled for sync work.
pub struct Dispatcher {
    registry: HandlerRegistry,
    executor: Arc<BoundedExecutor>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, executor: Arc<BoundedExecutor>) -> Self {
        Self { registry, executor }
    }

    pub fn executor(&self) -> &Arc<BoundedExecutor> {
        &self.executor
    }

    /// Look up the handler for `envelope.payload_type` and invoke it.
    ///
    /// An unknown discriminator is a first-class
    /// [`TransportError::HandlerNotFound`], distinct from transport errors.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        ctx: LocalContext,
    ) -> Result<Envelope, TransportError> {
        match self.registry.handlers.get(&envelope.payload_type) {
            None => Err(TransportError::HandlerNotFound {
                payload_type: envelope.payload_type.clone(),
            }),
            Some(Registered::Async(handler)) => handler.handle(envelope, ctx).await,
            Some(Registered::Sync(handler)) => {
                let handler = Arc::clone(handler);
                self.executor
                    .submit(move || handler(envelope, ctx))
                    .await?
            }
        }
    }
}
