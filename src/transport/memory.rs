//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! [`MemoryBroker`] simulates an AMQP-style broker:
//!
//! - Exchanges route by kind: `topic` (with `*` and `#` wildcards), `direct`
//!   (exact match), `fanout` and `headers` (every bound queue).
//! - A message reaches each matching queue once; within a queue, consumers
//!   are served round-robin.
//! - Queues are named or broker-named (`amq.gen-…`). Exclusive queues belong
//!   to the transport that declared them. Auto-delete queues vanish with
//!   their last consumer.
//! - Delivery is synchronous: once `publish()` returns, every handler has run.
//!
//! ## Non-Goals
//!
//! Queues do not buffer messages while they have no consumer, and nothing is
//! persisted. The broker exists to provide a clear, deterministic baseline
//! against which higher-level behavior can be validated.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::RwLock;
use uuid::Uuid;

#[allow(unused_imports)]
use crate::{
    // ---
    decode_content,
    log_debug,
    log_info,
    Delivery,
    Disposer,
    ExchangeKind,
    MessageHandler,
    PubSubConfig,
    PubSubError,
    PublishOptions,
    QueueOptions,
    Result,
    SubscribeOptions,
    Transport,
    TransportBase,
    TransportPtr,
};

struct MemoryConsumer {
    tag: Arc<str>,
    owner: String,
    routing_key: Arc<str>,
    handler: MessageHandler,
}

struct MemoryQueue {
    options: QueueOptions,
    /// Transport id owning an exclusive queue.
    owner: Option<String>,
    /// (exchange, binding key)
    bindings: Vec<(String, String)>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    next_tag: u64,
    next_delivery: u64,
}

/// One routed message, resolved under the lock and delivered after it.
struct Routed {
    handler: MessageHandler,
    routing_key: Arc<str>,
    delivery: Delivery,
}

/// Shared in-process broker for the in-memory transport.
///
/// All `MemoryTransport` instances sharing a `MemoryBroker` see each other's
/// messages, exactly as clients connected to one real broker would.
///
/// # Testing
///
/// For tests that need isolation, construct a broker explicitly and pass it
/// to [`create_memory_transport_with_broker`]. The inspection methods
/// ([`consumer_count`](Self::consumer_count), [`queue_exists`](Self::queue_exists),
/// [`bindings`](Self::bindings)) let tests observe what the broker sees.
///
/// ```
/// # use mom_pubsub::{MemoryBroker, PubSubConfig};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let broker = MemoryBroker::new();
/// let _transport = mom_pubsub::create_memory_transport_with_broker(
///     &PubSubConfig::memory("node-a"),
///     broker.clone(),
/// )
/// .await?;
/// assert_eq!(broker.total_consumers().await, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryBroker {
    state: RwLock<BrokerState>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of consumers on `queue` (0 if it does not exist).
    pub async fn consumer_count(&self, queue: &str) -> usize {
        // ---
        let state = self.state.read().await;
        state.queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Number of consumers across all queues.
    pub async fn total_consumers(&self) -> usize {
        // ---
        let state = self.state.read().await;
        state.queues.values().map(|q| q.consumers.len()).sum()
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.state.read().await.queues.contains_key(queue)
    }

    /// Names of all declared queues, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        // ---
        let state = self.state.read().await;
        let mut names: Vec<_> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binding keys of `queue`, in binding order.
    pub async fn bindings(&self, queue: &str) -> Vec<String> {
        // ---
        let state = self.state.read().await;
        state
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default()
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes, opts: &PublishOptions) -> Result<()> {
        // ---
        let routed = {
            let mut state = self.state.write().await;
            let kind = state.exchanges.get(exchange).copied().unwrap_or_default();
            let first_tag = state.next_delivery;
            let mut routed = Vec::new();

            for queue in state.queues.values_mut() {
                let bound = queue
                    .bindings
                    .iter()
                    .any(|(ex, pattern)| ex == exchange && binding_matches(kind, pattern, routing_key));
                if !bound || queue.consumers.is_empty() {
                    continue;
                }

                let slot = queue.next_consumer % queue.consumers.len();
                queue.next_consumer = slot + 1;
                let consumer = &queue.consumers[slot];
                let delivery_tag = first_tag + routed.len() as u64;

                routed.push(Routed {
                    handler: Arc::clone(&consumer.handler),
                    routing_key: Arc::clone(&consumer.routing_key),
                    delivery: Delivery {
                        exchange: exchange.into(),
                        routing_key: routing_key.into(),
                        payload: payload.clone(),
                        content_type: Some(opts.content_type.as_str().into()),
                        redelivered: false,
                        delivery_tag,
                        consumer_tag: Arc::clone(&consumer.tag),
                    },
                });
            }

            state.next_delivery += routed.len() as u64;
            routed
        };

        if routed.is_empty() {
            log_debug!("memory: no queue bound for \"{routing_key}\" on \"{exchange}\"");
            return Ok(());
        }

        let content = decode_content(&payload);
        for r in routed {
            (r.handler)(&r.routing_key, &content, &r.delivery);
        }
        Ok(())
    }

    async fn subscribe(
        self: &Arc<Self>,
        base: &TransportBase,
        routing_key: &str,
        handler: MessageHandler,
        opts: &SubscribeOptions,
    ) -> Result<Disposer> {
        // ---
        let exchange = base.exchange.name.clone();
        let owner = base.transport_id.clone();

        let (queue_name, tag) = {
            let mut state = self.state.write().await;
            state.exchanges.entry(exchange.clone()).or_insert(base.exchange.kind);

            let queue_name = match opts.queue.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("amq.gen-{}", Uuid::new_v4().simple()),
            };

            let tag: Arc<str> = match &opts.consume.consumer_tag {
                Some(tag) => tag.as_str().into(),
                None => {
                    state.next_tag += 1;
                    format!("ctag-{owner}-{}", state.next_tag).into()
                }
            };

            let queue = state
                .queues
                .entry(queue_name.clone())
                .or_insert_with(|| MemoryQueue {
                    options: opts.queue.options.clone(),
                    owner: opts.queue.options.exclusive.then(|| owner.clone()),
                    bindings: Vec::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                });

            if let Some(holder) = &queue.owner {
                if *holder != owner {
                    return Err(PubSubError::Transport(format!(
                        "memory: queue \"{queue_name}\" is exclusive to \"{holder}\""
                    )));
                }
            }
            if opts.consume.exclusive && !queue.consumers.is_empty() {
                return Err(PubSubError::Transport(format!(
                    "memory: queue \"{queue_name}\" already has consumers"
                )));
            }
            if queue.consumers.iter().any(|c| c.tag == tag) {
                return Err(PubSubError::Transport(format!(
                    "memory: consumer tag \"{tag}\" already in use on \"{queue_name}\""
                )));
            }

            let binding = (exchange.clone(), routing_key.to_string());
            if !queue.bindings.contains(&binding) {
                queue.bindings.push(binding);
            }

            queue.consumers.push(MemoryConsumer {
                tag: Arc::clone(&tag),
                owner: owner.clone(),
                routing_key: routing_key.into(),
                handler,
            });

            (queue_name, tag)
        };

        log_debug!("{owner}: consuming \"{queue_name}\" for \"{routing_key}\" ({tag})");

        let broker = Arc::clone(self);
        let routing_key = routing_key.to_string();
        let unbind = opts.queue.unbind_on_dispose;
        let delete = opts.queue.delete_on_dispose;

        Ok(Disposer::new(move || async move {
            broker
                .cancel(&queue_name, &tag, &exchange, &routing_key, unbind, delete)
                .await
        }))
    }

    async fn cancel(
        &self,
        queue_name: &str,
        tag: &str,
        exchange: &str,
        routing_key: &str,
        unbind: bool,
        delete: bool,
    ) -> Result<()> {
        // ---
        log_debug!("memory: disposing consumer {tag} on \"{queue_name}\"");

        let mut state = self.state.write().await;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            // Deleted already, nothing left to cancel.
            return Ok(());
        };

        queue.consumers.retain(|c| &*c.tag != tag);

        if unbind {
            queue
                .bindings
                .retain(|(ex, key)| !(ex == exchange && key == routing_key));
        }

        if delete || (queue.options.auto_delete && queue.consumers.is_empty()) {
            state.queues.remove(queue_name);
        }
        Ok(())
    }

    async fn close(&self, transport_id: &str) -> Result<()> {
        // ---
        log_debug!("{transport_id}: closing transport...");

        let mut state = self.state.write().await;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.owner != transport_id);
        }
        state.queues.retain(|_, q| {
            let owned = q.owner.as_deref() == Some(transport_id);
            let emptied = q.options.auto_delete && q.consumers.is_empty();
            !owned && !emptied
        });
        Ok(())
    }
}

/// Whether a binding key routes `routing_key` on an exchange of `kind`.
fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
    }
}

/// AMQP topic matching: words are dot separated, `*` matches exactly one
/// word and `#` matches zero or more words.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, tail)) if word == "*" || word == first => match_words(rest, tail),
            _ => false,
        },
    }
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryBroker`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    broker: Arc<MemoryBroker>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, routing_key: &str, payload: Bytes, opts: &PublishOptions) -> Result<()> {
        // ---
        self.ensure_open()?;
        {
            let mut state = self.broker.state.write().await;
            state
                .exchanges
                .entry(self.base.exchange.name.clone())
                .or_insert(self.base.exchange.kind);
        }
        self.broker
            .publish(&self.base.exchange.name, routing_key, payload, opts)
            .await
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        on_message: MessageHandler,
        opts: &SubscribeOptions,
    ) -> Result<Disposer> {
        // ---
        self.ensure_open()?;
        self.broker
            .subscribe(&self.base, routing_key, on_message, opts)
            .await
    }

    /// Cancel this transport's consumers and drop its exclusive queues.
    /// Other transports on the same broker are unaffected. Idempotent.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker.close(self.transport_id()).await
    }
}

/// Process-global broker used by [`create_memory_transport`].
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

fn global_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

/// Create a new in-memory transport on the process-global broker.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: &PubSubConfig) -> Result<TransportPtr> {
    create_memory_transport_with_broker(config, global_broker()).await
}

/// Create a new in-memory transport on the provided broker.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_broker(
    config: &PubSubConfig,
    broker: Arc<MemoryBroker>,
) -> Result<TransportPtr> {
    // ---
    log_info!("{}: create memory transport", config.transport_id);

    Ok(Arc::new(MemoryTransport {
        base: TransportBase::from(config),
        broker,
        closed: AtomicBool::new(false),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Exchange, Queue};
    use serde_json::Value;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    fn recorder() -> (Seen, MessageHandler) {
        // ---
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |key: &str, content: &Value, _raw: &Delivery| {
            sink.lock().unwrap().push((key.to_string(), content.clone()));
        });
        (seen, handler)
    }

    async fn transport(broker: &Arc<MemoryBroker>, id: &str) -> TransportPtr {
        create_memory_transport_with_broker(&PubSubConfig::memory(id), Arc::clone(broker))
            .await
            .expect("memory transport")
    }

    #[test]
    fn topic_wildcards() {
        // ---
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created.#", "orders.created"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_decoded_content() {
        // ---
        let broker = MemoryBroker::new();
        let t = transport(&broker, "a").await;
        let (seen, handler) = recorder();

        let _disposer = t
            .subscribe("orders.*", handler, &SubscribeOptions::queue("q1"))
            .await
            .expect("subscribe");

        t.publish("orders.created", Bytes::from_static(br#"{"id":1}"#), &PublishOptions::default())
            .await
            .expect("publish");
        t.publish("users.created", Bytes::from_static(b"ignored"), &PublishOptions::default())
            .await
            .expect("publish");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "orders.*");
        assert_eq!(seen[0].1["id"], 1);
    }

    #[tokio::test]
    async fn consumers_on_one_queue_are_served_round_robin() {
        // ---
        let broker = MemoryBroker::new();
        let t = transport(&broker, "a").await;
        let (first, h1) = recorder();
        let (second, h2) = recorder();
        let opts = SubscribeOptions::queue("shared");

        let _d1 = t.subscribe("k", h1, &opts).await.expect("subscribe 1");
        let _d2 = t.subscribe("k", h2, &opts).await.expect("subscribe 2");

        for _ in 0..4 {
            t.publish("k", Bytes::from_static(b"1"), &PublishOptions::default())
                .await
                .expect("publish");
        }

        assert_eq!(first.lock().unwrap().len(), 2);
        assert_eq!(second.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dispose_honours_unbind_and_delete_flags() {
        // ---
        let broker = MemoryBroker::new();
        let t = transport(&broker, "a").await;

        let keep = Queue::named("keep").with_options(QueueOptions {
            auto_delete: false,
            ..QueueOptions::default()
        });
        let d = t
            .subscribe("k", recorder().1, &SubscribeOptions::new(keep.clone()))
            .await
            .expect("subscribe");
        d.dispose().await.expect("dispose");
        assert!(broker.queue_exists("keep").await);
        assert_eq!(broker.bindings("keep").await, vec!["k".to_string()]);

        let unbind = keep.clone().with_unbind_on_dispose(true);
        let d = t
            .subscribe("k", recorder().1, &SubscribeOptions::new(unbind))
            .await
            .expect("subscribe");
        d.dispose().await.expect("dispose");
        assert!(broker.bindings("keep").await.is_empty());

        let delete = keep.with_delete_on_dispose(true);
        let d = t
            .subscribe("k", recorder().1, &SubscribeOptions::new(delete))
            .await
            .expect("subscribe");
        d.dispose().await.expect("dispose");
        assert!(!broker.queue_exists("keep").await);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_last_consumer() {
        // ---
        let broker = MemoryBroker::new();
        let t = transport(&broker, "a").await;

        let d = t
            .subscribe("k", recorder().1, &SubscribeOptions::new(Queue::anonymous()))
            .await
            .expect("subscribe");

        let names = broker.queue_names().await;
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("amq.gen-"));

        d.dispose().await.expect("dispose");
        assert!(broker.queue_names().await.is_empty());
    }

    #[tokio::test]
    async fn exclusive_queue_rejects_other_transports() {
        // ---
        let broker = MemoryBroker::new();
        let a = transport(&broker, "a").await;
        let b = transport(&broker, "b").await;
        let opts = SubscribeOptions::queue("private");

        let _d = a.subscribe("k", recorder().1, &opts).await.expect("owner subscribes");
        let err = b.subscribe("k", recorder().1, &opts).await.unwrap_err();
        assert!(matches!(err, PubSubError::Transport(_)));
    }

    #[tokio::test]
    async fn direct_exchange_requires_exact_key() {
        // ---
        let broker = MemoryBroker::new();
        let config = PubSubConfig::memory("a").with_exchange(Exchange {
            name: "direct-ex".into(),
            kind: ExchangeKind::Direct,
            ..Exchange::default()
        });
        let t = create_memory_transport_with_broker(&config, Arc::clone(&broker))
            .await
            .expect("transport");
        let (seen, handler) = recorder();

        let _d = t
            .subscribe("orders.*", handler, &SubscribeOptions::queue("q"))
            .await
            .expect("subscribe");
        t.publish("orders.created", Bytes::from_static(b"1"), &PublishOptions::default())
            .await
            .expect("publish");
        t.publish("orders.*", Bytes::from_static(b"2"), &PublishOptions::default())
            .await
            .expect("publish");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, Value::from(2));
    }

    #[tokio::test]
    async fn close_only_drops_own_consumers() {
        // ---
        let broker = MemoryBroker::new();
        let a = transport(&broker, "a").await;
        let b = transport(&broker, "b").await;

        let _da = a
            .subscribe("k", recorder().1, &SubscribeOptions::queue("qa"))
            .await
            .expect("subscribe a");
        let _db = b
            .subscribe("k", recorder().1, &SubscribeOptions::queue("qb"))
            .await
            .expect("subscribe b");
        assert_eq!(broker.total_consumers().await, 2);

        a.close().await.expect("close");
        assert_eq!(broker.total_consumers().await, 1);
        assert!(!broker.queue_exists("qa").await);
        assert!(broker.queue_exists("qb").await);

        let err = a
            .publish("k", Bytes::from_static(b"1"), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Closed));
        a.close().await.expect("second close is a no-op");
    }
}
