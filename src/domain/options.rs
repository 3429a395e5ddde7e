// src/domain/options.rs

//! Exchange, queue, consume and publish options.
//!
//! These mirror the knobs an AMQP topic broker exposes, but carry no client
//! library types. Transports translate them into whatever their broker
//! understands; the in-memory transport honours all of them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl ExchangeKind {
    /// Wire name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// The exchange every message is published to and every queue is bound to.
///
/// Defaults to a non-durable, non-auto-delete topic exchange named
/// `graphql_subscriptions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Exchange {
    /// Default exchange name.
    pub const DEFAULT_NAME: &'static str = "graphql_subscriptions";

    /// A topic exchange with the given name and default flags.
    pub fn topic(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        // ---
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            kind: ExchangeKind::Topic,
            durable: false,
            auto_delete: false,
        }
    }
}

/// Queue declaration flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    /// Broker arguments sent with the queue declaration and its binding,
    /// e.g. `x-message-ttl` or the match headers of a headers exchange.
    pub arguments: BTreeMap<String, Value>,
}

impl Default for QueueOptions {
    /// Exclusive, non-durable, auto-delete, no arguments.
    fn default() -> Self {
        Self {
            exclusive: true,
            durable: false,
            auto_delete: true,
            arguments: BTreeMap::new(),
        }
    }
}

impl QueueOptions {
    /// Add one broker argument.
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// A queue a subscription consumes from.
///
/// The queue name is also half of the routing group key used by the
/// multiplexer: subscriptions that share a queue name and a routing key share
/// one broker consumer. An anonymous queue (`name: None`) lets the broker pick
/// a name; all anonymous subscriptions then group under the empty name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Queue {
    pub name: Option<String>,
    pub options: QueueOptions,
    /// Unbind the queue from the exchange when its consumer is disposed.
    pub unbind_on_dispose: bool,
    /// Delete the queue when its consumer is disposed.
    pub delete_on_dispose: bool,
}

impl Queue {
    /// A named queue with default declaration flags.
    pub fn named(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// A broker-named queue with default declaration flags.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_unbind_on_dispose(mut self, unbind: bool) -> Self {
        self.unbind_on_dispose = unbind;
        self
    }

    pub fn with_delete_on_dispose(mut self, delete: bool) -> Self {
        self.delete_on_dispose = delete;
        self
    }

    /// Name used to group subscriptions; empty for anonymous queues.
    pub fn group_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Consumer flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Deliveries need no acknowledgement. When `false`, transports ack each
    /// delivery after it has been dispatched.
    pub no_ack: bool,
    pub exclusive: bool,
    /// Explicit consumer tag; the transport generates one when `None`.
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        // ---
        Self {
            no_ack: true,
            exclusive: false,
            consumer_tag: None,
        }
    }
}

/// Options for [`PubSub::subscribe`](crate::PubSub::subscribe).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    pub queue: Queue,
    pub consume: ConsumeOptions,
}

impl SubscribeOptions {
    /// Subscribe through the given queue with default consume flags.
    pub fn new(queue: Queue) -> Self {
        // ---
        Self {
            queue,
            consume: ConsumeOptions::default(),
        }
    }

    /// Subscribe through a named queue with default flags.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(Queue::named(name))
    }

    pub fn with_consume(mut self, consume: ConsumeOptions) -> Self {
        self.consume = consume;
        self
    }

    /// Queue name identifying the routing group.
    pub fn queue_name(&self) -> &str {
        self.queue.group_name()
    }
}

/// Per-message publish options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub content_type: String,
    /// Ask the broker to persist the message (delivery mode 2).
    pub persistent: bool,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        // ---
        Self {
            content_type: "application/json".to_string(),
            persistent: false,
            expiration: None,
            priority: None,
        }
    }
}
