//! Topic publish/subscribe over a message broker.
//!
//! This library multiplexes many logical subscriptions onto as few broker
//! consumers as possible: subscriptions that share a queue and a routing key
//! share one consumer, and every delivery is fanned out to all of them. On top
//! of that it offers a pull-based async iterator over one or more triggers.
//!
//! Transports are pluggable. The in-memory transport is always available; an
//! AMQP transport built on `lapin` is behind the `transport_lapin` feature.

// Import all sub modules once...
mod macros;

mod builder;
mod codec;
mod config;
mod domain;
mod error;
mod iterator;
mod pubsub;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use builder::PubSubBuilder;
pub use iterator::PubSubAsyncIterator;
pub use pubsub::{Listener, PubSub, PubSubEngine, SubscriptionId, FANOUT};

pub use config::PubSubConfig;

pub use codec::decode_content;
pub use error::{PubSubError, Result};

pub use transport::{create_memory_transport, create_memory_transport_with_broker, MemoryBroker};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    ConsumeOptions,
    Delivery,
    Disposer,
    Exchange,
    ExchangeKind,
    MessageHandler,
    PublishOptions,
    Queue,
    QueueOptions,
    SubscribeOptions,
    Transport,
    TransportBase,
    TransportPtr,
};

/// Create the transport a config asks for.
///
/// A config with a `transport_uri` gets the broker transport compiled in;
/// without one, or without a broker transport, the in-memory transport is used.
pub async fn create_transport(config: &PubSubConfig) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "transport_lapin")]
    {
        if config.transport_uri.is_some() {
            return create_lapin_transport(config).await;
        }
    }

    if config.transport_uri.is_some() {
        log_warn!(
            "{}: no broker transport compiled in, ignoring transport_uri",
            config.transport_id
        );
    }
    create_memory_transport(config).await
}
