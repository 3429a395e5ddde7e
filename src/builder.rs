//! Fluent builder for [`PubSub`] instances.
//!
//! Separates required settings (`node_id`) from optional ones and validates the
//! combination once, at [`PubSubBuilder::build`].

use std::sync::Arc;

use crate::{
    //
    log_info,
    Exchange,
    MemoryBroker,
    PubSub,
    PubSubConfig,
    PubSubError,
    Queue,
    Result,
    TransportPtr,
};

/// Builder for [`PubSub`] instances.
///
/// # Examples
///
/// ## In-memory, for tests and local runs
/// ```
/// use mom_pubsub::PubSubBuilder;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let pubsub = PubSubBuilder::new()
///     .node_id("orders-api")
///     .transport_type("memory")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## RabbitMQ with a custom exchange
/// ```no_run
/// use mom_pubsub::{Exchange, PubSubBuilder};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let pubsub = PubSubBuilder::new()
///     .uri("amqp://localhost:5672/%2f")
///     .node_id("orders-api")
///     .exchange(Exchange::topic("orders"))
///     .transport_type("lapin")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct PubSubBuilder {
    uri: Option<String>,
    node_id: Option<String>,
    exchange: Option<Exchange>,
    default_queue: Option<Queue>,
    transport_type: Option<String>,
    broker: Option<Arc<MemoryBroker>>,
}

impl PubSubBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URI.
    ///
    /// Required by broker-backed transports, e.g. `"amqp://localhost:5672/%2f"`.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the node ID (required).
    ///
    /// Becomes the transport id used in logs and generated consumer tags.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Override the default `graphql_subscriptions` topic exchange.
    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Queue returned by [`PubSubConfig::subscribe_options`].
    pub fn default_queue(mut self, queue: Queue) -> Self {
        self.default_queue = Some(queue);
        self
    }

    /// Set explicit transport type.
    ///
    /// Valid values: `"memory"`, `"lapin"`
    ///
    /// If not specified, a URI selects the broker transport compiled in and
    /// no URI selects the in-memory one.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Run the in-memory transport on a private broker instead of the
    /// process-global one.
    pub fn memory_broker(mut self, broker: Arc<MemoryBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Validate the settings into a [`PubSubConfig`] without connecting.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::MissingConfig`] if `node_id` is missing, or a broker
    ///   transport is requested without a URI.
    /// - [`PubSubError::ConfigConflict`] if a URI or a memory broker is given
    ///   to a transport that cannot use it.
    pub fn config(&self) -> Result<PubSubConfig> {
        // ---
        let node_id = self
            .node_id
            .clone()
            .ok_or_else(|| PubSubError::MissingConfig("node_id".into()))?;

        match (self.transport_type.as_deref(), &self.uri) {
            (Some("memory"), Some(_)) => {
                return Err(PubSubError::ConfigConflict(
                    "the memory transport does not take a uri".into(),
                ));
            }
            (Some("lapin"), None) => {
                return Err(PubSubError::MissingConfig("uri (required by lapin)".into()));
            }
            _ => {}
        }

        if self.broker.is_some() && self.uri.is_some() {
            return Err(PubSubError::ConfigConflict(
                "a memory broker cannot be combined with a broker uri".into(),
            ));
        }

        let mut config = match &self.uri {
            Some(uri) => PubSubConfig::with_broker(uri.clone(), node_id),
            None => PubSubConfig::memory(node_id),
        };
        if let Some(exchange) = &self.exchange {
            config = config.with_exchange(exchange.clone());
        }
        if let Some(queue) = &self.default_queue {
            config = config.with_default_queue(queue.clone());
        }
        Ok(config)
    }

    /// Build the transport and wrap it in a [`PubSub`] (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Validation fails (see [`config`](Self::config))
    /// - `transport_type` is not recognized or not compiled in
    /// - Transport creation fails
    pub async fn build(self) -> Result<PubSub> {
        // ---
        let config = self.config()?;
        let transport = self.create_transport(&config).await?;

        log_info!(
            "{}: pubsub built on exchange \"{}\"",
            config.transport_id,
            config.exchange.name
        );
        Ok(PubSub::new(transport))
    }

    async fn create_transport(self, config: &PubSubConfig) -> Result<TransportPtr> {
        // ---
        if let Some(broker) = self.broker {
            return crate::create_memory_transport_with_broker(config, broker).await;
        }

        match self.transport_type.as_deref() {
            Some("memory") => crate::create_memory_transport(config).await,
            Some("lapin") => create_lapin(config).await,
            Some(other) => Err(PubSubError::Transport(format!(
                "unrecognized transport_type: {other}, valid values: memory, lapin"
            ))),
            None => crate::create_transport(config).await,
        }
    }
}

#[cfg(feature = "transport_lapin")]
async fn create_lapin(config: &PubSubConfig) -> Result<TransportPtr> {
    crate::create_lapin_transport(config).await
}

#[cfg(not(feature = "transport_lapin"))]
async fn create_lapin(_config: &PubSubConfig) -> Result<TransportPtr> {
    Err(PubSubError::Transport(
        "transport_type \"lapin\" requires the transport_lapin feature".into(),
    ))
}
