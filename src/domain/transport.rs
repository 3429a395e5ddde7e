// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the interface the multiplexer uses to reach a message
//! broker. It intentionally avoids any reference to concrete protocols or
//! client libraries.
//!
//! A transport owns the physical connection, declares exchanges and queues,
//! binds them, and delivers messages. It does not know about logical
//! subscriptions: every call to [`Transport::subscribe`] creates exactly one
//! broker consumer, and the returned [`Disposer`] is the only way to remove
//! it. Sharing consumers between many listeners is the multiplexer's job.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{
    //
    Exchange,
    PubSubConfig,
    PublishOptions,
    Result,
    SubscribeOptions,
};

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base`:
///
/// ```ignore
/// struct AmqpTransport {
///     base: TransportBase,
///     // ... lapin specific fields
/// }
///
/// impl Transport for AmqpTransport {
///     fn base(&self) -> &TransportBase { &self.base }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct TransportBase {
    /// Identifier for this transport instance, used for logging.
    pub transport_id: String,
    /// Exchange messages are published to and queues are bound to.
    pub exchange: Exchange,
}

impl TransportBase {
    pub fn new(transport_id: impl Into<String>, exchange: Exchange) -> Self {
        // ---
        Self {
            transport_id: transport_id.into(),
            exchange,
        }
    }
}

impl From<&PubSubConfig> for TransportBase {
    fn from(config: &PubSubConfig) -> Self {
        // ---
        Self {
            transport_id: config.transport_id.clone(),
            exchange: config.exchange.clone(),
        }
    }
}

/// A raw message as delivered by the broker.
///
/// Listeners receive this alongside the decoded content so they can inspect
/// broker metadata or re-decode the body themselves.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: Arc<str>,
    /// Routing key the message was published with.
    pub routing_key: Arc<str>,
    /// Undecoded message body.
    pub payload: Bytes,
    pub content_type: Option<Arc<str>>,
    pub redelivered: bool,
    pub delivery_tag: u64,
    /// Tag of the consumer that received the message.
    pub consumer_tag: Arc<str>,
}

/// Callback a transport invokes for every message its consumer receives.
///
/// Arguments are the routing key the consumer was created for, the decoded
/// content and the raw delivery. Handlers run synchronously on the
/// transport's delivery task and must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &Value, &Delivery) + Send + Sync>;

/// Cancels one broker consumer.
///
/// Returned by [`Transport::subscribe`]. Disposing cancels the consumer and,
/// when the subscription's queue asks for it, unbinds and/or deletes the
/// queue. A disposer runs at most once: [`dispose`](Disposer::dispose)
/// consumes it.
pub struct Disposer {
    inner: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl Disposer {
    /// Wrap an async teardown closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        Self {
            inner: Box::new(move || Box::pin(f())),
        }
    }

    /// A disposer with nothing to tear down.
    pub fn noop() -> Self {
        Self::new(|| async { Ok(()) })
    }

    /// Run the teardown.
    pub async fn dispose(self) -> Result<()> {
        (self.inner)().await
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposer")
    }
}

/// Message transport abstraction.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point with a matching routing key are delivered to the handler.
/// - Each successful `subscribe()` creates exactly one consumer, removed only
///   by its [`Disposer`] or by `close()`.
/// - Message bodies are decoded with [`decode_content`](crate::decode_content)
///   before the handler is invoked.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Returns the exchange this transport publishes to.
    fn exchange(&self) -> &Exchange {
        &self.base().exchange
    }

    /// Publish an already encoded payload under `routing_key`.
    async fn publish(&self, routing_key: &str, payload: Bytes, opts: &PublishOptions)
        -> Result<()>;

    /// Declare and bind the subscription's queue, start one consumer on it and
    /// route every delivery to `on_message`.
    async fn subscribe(
        &self,
        routing_key: &str,
        on_message: MessageHandler,
        opts: &SubscribeOptions,
    ) -> Result<Disposer>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only increments a reference count; every clone talks to the
/// same underlying connection.
pub type TransportPtr = Arc<dyn Transport>;
