//! Public, transport-agnostic pub/sub configuration.
//!
//! This type contains no client-library concepts. Transport layers are
//! responsible for interpreting it into concrete connection settings.

use serde::{Deserialize, Serialize};

use crate::{Exchange, Queue};

/// Transport configuration and connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    // ---
    /// Broker connection URI (e.g. `"amqp://localhost:5672/%2f"`).
    ///
    /// `None` for the in-memory transport.
    pub transport_uri: Option<String>,

    /// Identifier for this transport instance, used for logging and consumer
    /// tags.
    pub transport_id: String,

    /// Exchange used for publishing and binding.
    #[serde(default)]
    pub exchange: Exchange,

    /// Queue handed out by [`subscribe_options`](Self::subscribe_options) to
    /// callers that do not care which queue they consume from.
    ///
    /// `None` means an anonymous, broker-named queue.
    #[serde(default)]
    pub default_queue: Option<Queue>,
}

impl PubSubConfig {
    /// Create a config for a broker-backed transport.
    pub fn with_broker(transport_uri: impl Into<String>, transport_id: impl Into<String>) -> Self {
        // ---
        Self {
            transport_uri: Some(transport_uri.into()),
            transport_id: transport_id.into(),
            exchange: Exchange::default(),
            default_queue: None,
        }
    }

    /// Create a memory transport config (no broker).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        // ---
        Self {
            transport_uri: None,
            transport_id: transport_id.into(),
            exchange: Exchange::default(),
            default_queue: None,
        }
    }

    /// Override the exchange.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_pubsub::{Exchange, PubSubConfig};
    ///
    /// let config = PubSubConfig::memory("orders").with_exchange(Exchange::topic("events"));
    /// assert_eq!(config.exchange.name, "events");
    /// ```
    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = exchange;
        self
    }

    /// Set the queue handed out by [`PubSubConfig::subscribe_options`].
    pub fn with_default_queue(mut self, queue: Queue) -> Self {
        self.default_queue = Some(queue);
        self
    }

    /// Subscribe options built from the default queue.
    pub fn subscribe_options(&self) -> crate::SubscribeOptions {
        // ---
        crate::SubscribeOptions::new(self.default_queue.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ExchangeKind;

    #[test]
    fn default_exchange_is_topic() {
        // ---
        let config = PubSubConfig::memory("node");
        assert_eq!(config.exchange.name, "graphql_subscriptions");
        assert_eq!(config.exchange.kind, ExchangeKind::Topic);
        assert!(!config.exchange.durable);
        assert!(!config.exchange.auto_delete);
    }

    #[test]
    fn subscribe_options_use_default_queue() {
        // ---
        let config = PubSubConfig::with_broker("amqp://localhost", "node")
            .with_default_queue(Queue::named("shared").with_delete_on_dispose(true));

        let opts = config.subscribe_options();
        assert_eq!(opts.queue_name(), "shared");
        assert!(opts.queue.delete_on_dispose);
        assert!(opts.consume.no_ack);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        // ---
        let config: PubSubConfig = serde_json::from_str(
            r#"{"transport_uri": null, "transport_id": "n", "exchange": {"name": "ev"}}"#,
        )
        .expect("config parses");

        assert_eq!(config.exchange.name, "ev");
        assert_eq!(config.exchange.kind, ExchangeKind::Topic);
        assert!(config.default_queue.is_none());
    }
}
