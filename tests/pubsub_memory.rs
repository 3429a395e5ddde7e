// tests/pubsub_memory.rs

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mom_pubsub::{
    // ---
    Delivery,
    MemoryBroker,
    PubSub,
    PubSubBuilder,
    PubSubConfig,
    PubSubError,
    Queue,
    SubscribeOptions,
    Transport,
    FANOUT,
};

const WAIT: Duration = Duration::from_millis(500);

async fn pubsub_on(broker: &Arc<MemoryBroker>, node: &str) -> PubSub {
    // ---
    let transport = mom_pubsub::create_memory_transport_with_broker(
        &PubSubConfig::memory(node),
        Arc::clone(broker),
    )
    .await
    .expect("failed to create memory transport");
    PubSub::new(transport)
}

/// Listener forwarding decoded content into a channel.
fn inbox() -> (
    impl Fn(&Value, &Delivery) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(Value, String)>,
) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |content: &Value, raw: &Delivery| {
        let _ = tx.send((content.clone(), raw.routing_key.to_string()));
    };
    (listener, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(Value, String)>) -> (Value, String) {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("listener channel closed unexpectedly")
}

#[tokio::test]
async fn subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "orders").await;
    let (listener, mut rx) = inbox();

    pubsub
        .subscribe("orders.created", listener, SubscribeOptions::queue("order-events"))
        .await
        .expect("subscribe failed");

    // ---
    // Act
    // ---
    pubsub
        .publish("orders.created", &json!({"id": 7, "total": 12.5}), None)
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    let (content, routing_key) = recv(&mut rx).await;
    assert_eq!(content, json!({"id": 7, "total": 12.5}));
    assert_eq!(routing_key, "orders.created");
}

#[tokio::test]
async fn subscribers_share_one_consumer_per_group() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "orders").await;
    let (first, mut rx1) = inbox();
    let (second, mut rx2) = inbox();
    let opts = SubscribeOptions::queue("order-events");

    let a = pubsub.subscribe("orders.*", first, opts.clone()).await.unwrap();
    let b = pubsub.subscribe("orders.*", second, opts).await.unwrap();
    assert_eq!(broker.consumer_count("order-events").await, 1);

    pubsub.publish("orders.shipped", &json!("box 1"), None).await.unwrap();
    assert_eq!(recv(&mut rx1).await.0, json!("box 1"));
    assert_eq!(recv(&mut rx2).await.0, json!("box 1"));

    pubsub.unsubscribe(a, "order-events").await.unwrap();
    assert_eq!(broker.consumer_count("order-events").await, 1);

    pubsub.unsubscribe(b, "order-events").await.unwrap();
    assert_eq!(broker.consumer_count("order-events").await, 0);
    // Default queues are auto-delete.
    assert!(!broker.queue_exists("order-events").await);
}

#[tokio::test]
async fn wildcard_bindings_filter_routing_keys() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "audit").await;
    let (listener, mut rx) = inbox();

    pubsub
        .subscribe("audit.#", listener, SubscribeOptions::queue("audit-log"))
        .await
        .unwrap();

    pubsub.publish("billing.invoice", &json!(0), None).await.unwrap();
    pubsub.publish("audit.login.failed", &json!(1), None).await.unwrap();
    pubsub.publish("audit", &json!(2), None).await.unwrap();

    assert_eq!(recv(&mut rx).await, (json!(1), "audit.login.failed".to_string()));
    assert_eq!(recv(&mut rx).await, (json!(2), "audit".to_string()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn non_json_payloads_arrive_as_text() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "raw").await;
    let (listener, mut rx) = inbox();

    pubsub.subscribe("raw", listener, SubscribeOptions::queue("raw-q")).await.unwrap();
    pubsub
        .transport()
        .publish("raw", bytes::Bytes::from_static(b"not { json"), &Default::default())
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.0, json!("not { json"));
}

#[tokio::test]
async fn fanout_subscriptions_get_private_keys() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "fan").await;
    let (first, mut rx1) = inbox();
    let (second, mut rx2) = inbox();

    let a = pubsub
        .subscribe(FANOUT, first, SubscribeOptions::new(Queue::anonymous()))
        .await
        .unwrap();
    let b = pubsub
        .subscribe(FANOUT, second, SubscribeOptions::new(Queue::anonymous()))
        .await
        .unwrap();
    assert_eq!(pubsub.group_count(), 2);
    assert_eq!(broker.total_consumers().await, 2);

    let key_a = pubsub.routing_key(a).expect("registered");
    pubsub.publish(&key_a, &json!("only a"), None).await.unwrap();

    assert_eq!(recv(&mut rx1).await.0, json!("only a"));
    assert!(rx2.try_recv().is_err());

    pubsub.unsubscribe(a, "").await.unwrap();
    pubsub.unsubscribe(b, "").await.unwrap();
    assert!(broker.queue_names().await.is_empty());
}

#[tokio::test]
async fn two_nodes_on_one_broker_see_each_other() {
    // ---
    let broker = MemoryBroker::new();
    let publisher = pubsub_on(&broker, "node-a").await;
    let subscriber = pubsub_on(&broker, "node-b").await;
    let (listener, mut rx) = inbox();

    subscriber
        .subscribe("greetings", listener, SubscribeOptions::queue("node-b-inbox"))
        .await
        .unwrap();
    publisher.publish("greetings", &json!({"from": "a"}), None).await.unwrap();

    assert_eq!(recv(&mut rx).await.0["from"], "a");
}

#[tokio::test]
async fn unsubscribe_with_wrong_queue_is_rejected() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "n").await;
    let (listener, _rx) = inbox();

    let id = pubsub.subscribe("k", listener, SubscribeOptions::queue("q")).await.unwrap();

    let err = pubsub.unsubscribe(id, "not-q").await.unwrap_err();
    assert!(matches!(err, PubSubError::UnknownSubscriptionRef { .. }));
    assert_eq!(broker.consumer_count("q").await, 1);

    pubsub.unsubscribe(id, "q").await.unwrap();
    assert!(matches!(
        pubsub.unsubscribe(id, "q").await,
        Err(PubSubError::UnknownSubscription(_))
    ));
}

#[tokio::test]
async fn unbind_and_delete_follow_queue_flags() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = pubsub_on(&broker, "n").await;

    let durable = Queue::named("keep").with_options(mom_pubsub::QueueOptions {
        exclusive: false,
        durable: true,
        auto_delete: false,
        ..mom_pubsub::QueueOptions::default()
    });

    let id = pubsub
        .subscribe("k", |_: &Value, _: &Delivery| {}, SubscribeOptions::new(durable.clone()))
        .await
        .unwrap();
    pubsub.unsubscribe(id, "keep").await.unwrap();
    assert!(broker.queue_exists("keep").await);
    assert_eq!(broker.bindings("keep").await, vec!["k".to_string()]);

    let id = pubsub
        .subscribe(
            "k",
            |_: &Value, _: &Delivery| {},
            SubscribeOptions::new(durable.with_unbind_on_dispose(true).with_delete_on_dispose(true)),
        )
        .await
        .unwrap();
    pubsub.unsubscribe(id, "keep").await.unwrap();
    assert!(!broker.queue_exists("keep").await);
}

#[tokio::test]
async fn close_releases_everything() {
    // ---
    let broker = MemoryBroker::new();
    let pubsub = PubSubBuilder::new()
        .node_id("closing")
        .memory_broker(Arc::clone(&broker))
        .build()
        .await
        .expect("build failed");

    for key in ["a", "b", "c"] {
        pubsub
            .subscribe(key, |_: &Value, _: &Delivery| {}, SubscribeOptions::queue(format!("q-{key}")))
            .await
            .unwrap();
    }
    assert_eq!(broker.total_consumers().await, 3);

    pubsub.close().await.expect("close failed");

    assert_eq!(broker.total_consumers().await, 0);
    assert_eq!(pubsub.subscription_count(), 0);
    assert!(matches!(
        pubsub.publish("a", &json!(1), None).await,
        Err(PubSubError::Closed)
    ));
}
