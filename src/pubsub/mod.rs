// src/pubsub/mod.rs

//! Subscription multiplexer.
//!
//! [`PubSub`] lets any number of logical subscriptions share one broker
//! consumer per routing group (queue name, routing key). The first subscriber
//! of a group creates the consumer, later ones piggyback on it, and the last
//! one to leave disposes it. Every delivery is fanned out to the group's
//! current members in registration order.
//!
//! ## Consumer creation
//!
//! Creating a consumer suspends on the transport, so other calls can run
//! meanwhile. Subscribers joining during that window return at once and share
//! the pending consumer. If the group emptied (or was recreated by someone
//! else) while the creation was in flight, the new consumer is disposed
//! straight away instead of being installed. At most one consumer per group
//! survives once creations settle.
//!
//! A failed creation is retried once for subscribers that joined while it
//! was pending; if the retry fails too they are evicted. A group therefore
//! never outlives its consumer.

mod registry;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_warn,
    Delivery,
    Disposer,
    MessageHandler,
    PubSubAsyncIterator,
    PublishOptions,
    Result,
    SubscribeOptions,
    TransportPtr,
};

use registry::{Abort, Attach, Detach, GroupKey, Registry};
pub use registry::{Listener, SubscriptionId};

/// Routing key that asks for a fresh, unshared topic.
///
/// Subscribing with this key generates a process-unique routing key, so each
/// call gets its own routing group and its own consumer.
pub const FANOUT: &str = "fanout";

/// The subscribe/unsubscribe capability the iterator bridge is built on.
///
/// Any source that can register a listener under a trigger name and remove it
/// again can back a [`PubSubAsyncIterator`], not only a broker.
#[async_trait::async_trait]
pub trait PubSubEngine: Send + Sync {
    /// Register `listener` for `trigger` and return its handle.
    async fn subscribe_listener(
        &self,
        trigger: &str,
        listener: Listener,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>;

    /// Remove a handle previously returned by `subscribe_listener`.
    async fn unsubscribe(&self, id: SubscriptionId, queue_name: &str) -> Result<()>;
}

/// Publish/subscribe front end over a [`Transport`](crate::Transport).
///
/// Cheap to clone; clones share the registry and the transport.
///
/// # Example
///
/// ```
/// # use mom_pubsub::{create_memory_transport, PubSub, PubSubConfig, SubscribeOptions};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = create_memory_transport(&PubSubConfig::memory("orders")).await?;
/// let pubsub = PubSub::new(transport);
///
/// let id = pubsub
///     .subscribe(
///         "orders.created",
///         |content, _raw| println!("order: {content}"),
///         SubscribeOptions::queue("order-events"),
///     )
///     .await?;
///
/// pubsub.publish("orders.created", &serde_json::json!({"id": 7}), None).await?;
/// pubsub.unsubscribe(id, "order-events").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

struct Inner {
    transport: TransportPtr,
    registry: Mutex<Registry>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock_ignore_poison(&self.registry)
    }

    /// Fan a delivery out to the group's current members.
    fn dispatch(&self, queue_name: &str, routing_key: &str, content: &Value, raw: &Delivery) {
        // ---
        let key = GroupKey::new(queue_name, routing_key);
        let listeners = self.registry().listeners(&key);

        if listeners.is_empty() {
            // Whoever removed the group holds the consumer's disposer.
            log_debug!("stale delivery on {key} dropped; its consumer is being disposed");
            return;
        }

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(content, raw))).is_err() {
                log_error!("listener {id} on {key} panicked; continuing fan-out");
            }
        }
    }
}

async fn dispose_logged(_key: &GroupKey, disposer: Disposer, _reason: &str) {
    // ---
    log_debug!("disposing {_reason} consumer for {_key}");
    if let Err(_err) = disposer.dispose().await {
        log_warn!("failed to dispose {_reason} consumer for {_key}: {_err}");
    }
}

impl PubSub {
    // ---
    /// Create a multiplexer on top of a transport.
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        log_debug!("{}: pubsub ready", transport.transport_id());
        Self {
            inner: Arc::new(Inner {
                transport,
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &TransportPtr {
        &self.inner.transport
    }

    /// Encode `payload` as JSON and publish it under `routing_key`.
    ///
    /// No local state is touched and transport failures are not retried.
    ///
    /// # Errors
    ///
    /// [`PubSubError::Serialization`](crate::PubSubError::Serialization) if the
    /// payload cannot be encoded, otherwise whatever the transport reports.
    pub async fn publish<T>(
        &self,
        routing_key: &str,
        payload: &T,
        options: Option<PublishOptions>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(payload)?);
        let options = options.unwrap_or_default();

        log_debug!(
            "publishing to exchange \"{}\" with key \"{routing_key}\" ({} bytes)",
            self.inner.transport.exchange().name,
            body.len()
        );

        self.inner.transport.publish(routing_key, body, &options).await
    }

    /// Subscribe `on_message` to `routing_key` through `options.queue`.
    ///
    /// Returns once the subscriber is attached. The first subscriber of a
    /// (queue, routing key) pair waits for the broker consumer to be created;
    /// later ones return immediately and share it. Passing [`FANOUT`] as the
    /// routing key subscribes to a freshly generated, unshared key.
    ///
    /// # Errors
    ///
    /// Transport failures while creating the consumer propagate unchanged and
    /// leave no registration behind for this call. Subscribers that joined the
    /// failed creation get one more attempt; see the module docs.
    pub async fn subscribe<F>(
        &self,
        routing_key: &str,
        on_message: F,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&Value, &Delivery) + Send + Sync + 'static,
    {
        self.subscribe_listener(routing_key, Arc::new(on_message), options).await
    }

    /// [`subscribe`](Self::subscribe) with an already shared listener.
    pub async fn subscribe_listener(
        &self,
        routing_key: &str,
        listener: Listener,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        // ---
        let routing_key = if routing_key == FANOUT {
            Uuid::new_v4().to_string()
        } else {
            routing_key.to_string()
        };

        let key = GroupKey::new(options.queue_name(), &routing_key);
        let (id, attach) = self.inner.registry().attach(&key, listener);

        log_debug!("subscribing to \"{routing_key}\" with id {id}");

        let generation = match attach {
            Attach::Joined => return Ok(id),
            Attach::Create { generation } => generation,
        };

        let Err(err) = self.create_consumer(&key, &options, generation).await else {
            return Ok(id);
        };

        log_warn!("failed to create consumer for {key}: {err}");
        let aborted = self.inner.registry().abort(&key, id, generation);
        if let Abort::Retry { generation } = aborted {
            self.retry_for_joined(&key, &options, generation).await;
        }
        Err(err)
    }

    /// Create the group's consumer and install it if `generation` is still
    /// the group's current creation.
    async fn create_consumer(
        &self,
        key: &GroupKey,
        options: &SubscribeOptions,
        generation: u64,
    ) -> Result<()> {
        // ---
        let handler = self.dispatcher(&key.queue_name);
        let disposer = self
            .inner
            .transport
            .subscribe(&key.routing_key, handler, options)
            .await?;

        let overtaken = self.inner.registry().complete(key, generation, disposer);
        if let Some(disposer) = overtaken {
            dispose_logged(key, disposer, "overtaken").await;
        }
        Ok(())
    }

    /// Second attempt for subscribers that joined a creation which failed.
    async fn retry_for_joined(&self, key: &GroupKey, options: &SubscribeOptions, generation: u64) {
        // ---
        log_debug!("retrying consumer for {key} on behalf of joined subscribers");

        if let Err(_err) = self.create_consumer(key, options, generation).await {
            let _evicted = self.inner.registry().evict(key, generation);
            log_error!(
                "dropping {} subscriber(s) of {key}, consumer creation failed twice: {_err}",
                _evicted.len()
            );
        }
    }

    /// Remove a subscription.
    ///
    /// Removing the last member of a routing group disposes its consumer,
    /// unbinding/deleting the queue when the subscription options asked for it.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::UnknownSubscription`](crate::PubSubError::UnknownSubscription)
    ///   if `id` is not registered.
    /// - [`PubSubError::UnknownSubscriptionRef`](crate::PubSubError::UnknownSubscriptionRef)
    ///   if no routing group under `queue_name` holds it.
    /// - Transport failures while disposing the consumer.
    pub async fn unsubscribe(&self, id: SubscriptionId, queue_name: &str) -> Result<()> {
        // ---
        let detached = self.inner.registry().detach(id, queue_name)?;

        log_debug!("unsubscribed id {id} from queue \"{queue_name}\"");

        match detached {
            Detach::Remaining | Detach::Last(None) => Ok(()),
            Detach::Last(Some(disposer)) => disposer.dispose().await,
        }
    }

    /// Pull-based view over one or more triggers.
    ///
    /// Subscribing starts in the background; the iterator can be polled right
    /// away. Items are decoded from the message content into `T`.
    pub fn async_iterator<T, I, S>(&self, triggers: I, options: SubscribeOptions) -> PubSubAsyncIterator<T>
    where
        T: DeserializeOwned + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        let engine: Arc<dyn PubSubEngine> = Arc::new(self.clone());
        PubSubAsyncIterator::new(engine, triggers, options)
    }

    /// Dispose every consumer and close the transport.
    ///
    /// All handles become unknown afterwards.
    pub async fn close(&self) -> Result<()> {
        // ---
        let groups = self.inner.registry().drain();
        for (key, disposer) in groups {
            dispose_logged(&key, disposer, "closing").await;
        }
        self.inner.transport.close().await
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry().subscription_count()
    }

    /// Number of routing groups (at most one consumer each).
    pub fn group_count(&self) -> usize {
        self.inner.registry().group_count()
    }

    /// Routing key a subscription was registered against.
    ///
    /// Useful after subscribing with [`FANOUT`] to learn the generated key.
    pub fn routing_key(&self, id: SubscriptionId) -> Option<String> {
        self.inner.registry().routing_key(id).map(str::to_string)
    }

    /// Transport callback bound to `queue_name`.
    fn dispatcher(&self, queue_name: &str) -> MessageHandler {
        // ---
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let queue_name = queue_name.to_string();

        Arc::new(move |routing_key: &str, content: &Value, raw: &Delivery| {
            if let Some(inner) = inner.upgrade() {
                inner.dispatch(&queue_name, routing_key, content, raw);
            }
        })
    }
}

#[async_trait::async_trait]
impl PubSubEngine for PubSub {
    async fn subscribe_listener(
        &self,
        trigger: &str,
        listener: Listener,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        PubSub::subscribe_listener(self, trigger, listener, options).await
    }

    async fn unsubscribe(&self, id: SubscriptionId, queue_name: &str) -> Result<()> {
        PubSub::unsubscribe(self, id, queue_name).await
    }
}
