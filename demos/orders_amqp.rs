//! Order events over RabbitMQ.
//!
//! Subscribes to every order event through a shared queue, then publishes a
//! few events and prints what comes back.
//!
//! Run with: cargo run --example orders_amqp --features transport_lapin
//!
//! Requires:
//! - An AMQP broker running on localhost:5672 (or set BROKER_URI)

use std::time::Duration;

use mom_pubsub::{
    //
    Delivery,
    Exchange,
    PubSubBuilder,
    Queue,
    Result,
    SubscribeOptions,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .with_line_number(true)
        .init();

    let broker_uri =
        std::env::var("BROKER_URI").unwrap_or_else(|_| "amqp://localhost:5672/%2f".to_string());

    let pubsub = PubSubBuilder::new()
        .uri(broker_uri)
        .node_id("orders-amqp")
        .exchange(Exchange::topic("orders"))
        .transport_type("lapin")
        .build()
        .await?;

    let queue = Queue::named("orders-audit").with_delete_on_dispose(true);
    let id = pubsub
        .subscribe(
            "orders.#",
            |content: &Value, raw: &Delivery| println!("{} -> {content}", raw.routing_key),
            SubscribeOptions::new(queue),
        )
        .await?;

    for (key, status) in [("orders.created", "created"), ("orders.shipped.eu", "shipped")] {
        pubsub.publish(key, &json!({"id": 42, "status": status}), None).await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    pubsub.unsubscribe(id, "orders-audit").await?;
    pubsub.close().await?;
    Ok(())
}
