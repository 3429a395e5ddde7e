//! Order events over the in-memory transport.
//!
//! Two dashboards subscribe to the same topic through one queue and share a
//! single consumer; an async iterator follows shipping events.
//!
//! Run with: RUST_LOG=debug cargo run --example orders_memory

use mom_pubsub::{
    //
    Delivery,
    PubSubBuilder,
    Result,
    SubscribeOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderEvent {
    id: u64,
    status: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .with_line_number(true)
        .init();

    let pubsub = PubSubBuilder::new()
        .node_id("orders-demo")
        .transport_type("memory")
        .build()
        .await?;

    let opts = SubscribeOptions::queue("dashboards");
    let sales = pubsub
        .subscribe(
            "orders.created",
            |content: &Value, _: &Delivery| println!("[sales]   new order {content}"),
            opts.clone(),
        )
        .await?;
    let support = pubsub
        .subscribe(
            "orders.created",
            |content: &Value, raw: &Delivery| {
                println!("[support] {} on {}: {content}", raw.consumer_tag, raw.routing_key)
            },
            opts,
        )
        .await?;
    println!("{} subscriptions over {} consumer(s)", pubsub.subscription_count(), pubsub.group_count());

    let shipping = pubsub.async_iterator::<OrderEvent, _, _>(["orders.shipped"], SubscribeOptions::queue("shipping"));
    // Give the iterator a moment to bind its queue.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    for id in 1..=3 {
        let created = OrderEvent {
            id,
            status: "created".into(),
        };
        pubsub.publish("orders.created", &created, None).await?;

        let shipped = OrderEvent {
            id,
            status: "shipped".into(),
        };
        pubsub.publish("orders.shipped", &shipped, None).await?;
    }

    for _ in 0..3 {
        if let Some(event) = shipping.next().await? {
            println!("[shipping] order {} is {}", event.id, event.status);
        }
    }
    shipping.close().await?;

    pubsub.unsubscribe(sales, "dashboards").await?;
    pubsub.unsubscribe(support, "dashboards").await?;
    pubsub.close().await?;
    Ok(())
}
