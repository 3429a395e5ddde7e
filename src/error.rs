use thiserror::Error;

use crate::SubscriptionId;

/// Errors that can occur while publishing, subscribing or unsubscribing.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// `unsubscribe` was called with a handle that is not registered.
    #[error("there is no subscription for id \"{0}\"")]
    UnknownSubscription(SubscriptionId),

    /// A handle is registered, but not in any routing group under the queue
    /// name passed to `unsubscribe`.
    #[error("there is no subscription ref for routing key \"{routing_key}\", id \"{id}\"")]
    UnknownSubscriptionRef {
        /// Routing key the handle was registered against.
        routing_key: String,
        /// The offending handle.
        id: SubscriptionId,
    },

    /// Any failure surfaced by the message transport (opaque to the core).
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport has already been closed.
    #[error("transport closed")]
    Closed,

    /// JSON serialization of an outbound payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Required configuration missing at build time.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Builder options that cannot be combined.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
}

/// Result type alias for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
