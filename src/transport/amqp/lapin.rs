//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! an AMQP broker connection. It follows an **actor-based concurrency model**
//! to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor declares the exchange, declares and binds queues, starts and
//!   cancels consumers, publishes, and shuts the connection down.
//! - All interaction with the AMQP client is serialized through this actor;
//!   no other task ever touches the connection directly.
//!
//! Every consumer gets its own delivery task. The task decodes each body with
//! [`decode_content`](crate::decode_content), invokes the handler and acks the
//! delivery when the consumer was started with `no_ack: false`.
//!
//! ## Exchange and queue semantics
//!
//! The configured exchange is declared once, on first use. Queues are declared
//! with the flags carried by [`SubscribeOptions`]; an anonymous queue is
//! declared with an empty name and the broker picks one. Disposing a consumer
//! cancels it and, when asked to, unbinds and/or deletes its queue.
//!
//! ## Connection behavior
//!
//! The connection is opened when the transport is created. There is no
//! reconnection: once the connection drops every call fails with a transport
//! error.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use lapin::{
    //
    message::Delivery as AmqpDelivery,
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind as AmqpExchangeKind,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    //
    decode_content,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Delivery,
    Disposer,
    ExchangeKind,
    MessageHandler,
    PubSubConfig,
    PubSubError,
    PublishOptions,
    Result,
    SubscribeOptions,
    Transport,
    TransportBase,
    TransportPtr,
};

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        routing_key: String,
        payload: Bytes,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        routing_key: String,
        handler: MessageHandler,
        opts: SubscribeOptions,
        resp: oneshot::Sender<Result<ConsumerRef>>,
    },
    Dispose {
        consumer: ConsumerRef,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Closed,
}

/// What a disposer needs to tear one consumer down.
struct ConsumerRef {
    tag: String,
    queue: String,
    routing_key: String,
    arguments: FieldTable,
    unbind: bool,
    delete: bool,
}

fn amqp_err(what: &str, e: lapin::Error) -> PubSubError {
    PubSubError::Transport(format!("amqp: {what} failed: {e}"))
}

/// Translate queue arguments into an AMQP field table.
fn field_table<'a>(entries: impl IntoIterator<Item = (&'a String, &'a Value)>) -> FieldTable {
    // ---
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert(key.as_str().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    // ---
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            let items: Vec<AMQPValue> = items.iter().map(amqp_value).collect();
            AMQPValue::FieldArray(items.into())
        }
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

/// Send a command to the actor and wait for its answer.
async fn request<T>(cmd_tx: &mpsc::Sender<Cmd>, cmd: Cmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    // ---
    // A closed command channel means the actor has shut down.
    cmd_tx.send(cmd).await.map_err(|_| PubSubError::Closed)?;

    rx.await.map_err(|e| {
        let msg = format!("actor responder channel read failed:{e}");
        PubSubError::Transport(msg)
    })?
}

/// AMQP transport implementation using lapin.
struct AmqpTransport {
    // ---
    base: TransportBase,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Creates a new AMQP transport with the given connection and channel.
    ///
    /// Spawns a background actor task to handle AMQP operations.
    fn create(base: TransportBase, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            base: base.clone(),
            connection,
            channel,
            cmd_rx,
            exchange_declared: false,
            consumers: HashMap::new(),
        };

        let handle = tokio::spawn(async move {
            actor.run().await;
        });

        Arc::new(Self {
            base,
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        })
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    base: TransportBase,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    exchange_declared: bool,
    /// Delivery tasks keyed by consumer tag.
    consumers: HashMap<String, JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.base.transport_id);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::Closed => {
                    log_info!("[{}] AMQP actor shutting down", self.base.transport_id);
                    break;
                }
            }
        }

        for (_, handle) in self.consumers.drain() {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP actor stopped", self.base.transport_id);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        match self.cmd_rx.recv().await {
            Some(cmd) => ActorStep::Cmd(cmd),
            None => ActorStep::Closed,
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Publish {
                routing_key,
                payload,
                opts,
                resp,
            } => {
                let result = self.do_publish(&routing_key, &payload, &opts).await;
                let _ = resp.send(result);
            }
            Cmd::Subscribe {
                routing_key,
                handler,
                opts,
                resp,
            } => {
                let result = self.do_subscribe(routing_key, handler, &opts).await;
                let _ = resp.send(result);
            }
            Cmd::Dispose { consumer, resp } => {
                let result = self.do_dispose(consumer).await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    async fn ensure_exchange(&mut self) -> Result<()> {
        // ---
        if self.exchange_declared {
            return Ok(());
        }

        let exchange = &self.base.exchange;
        let kind = match exchange.kind {
            ExchangeKind::Direct => AmqpExchangeKind::Direct,
            ExchangeKind::Fanout => AmqpExchangeKind::Fanout,
            ExchangeKind::Topic => AmqpExchangeKind::Topic,
            ExchangeKind::Headers => AmqpExchangeKind::Headers,
        };
        let opts = ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(exchange.name.as_str().into(), kind, opts, FieldTable::default())
            .await
            .map_err(|e| amqp_err("exchange declare", e))?;

        log_info!(
            "[{}] Declared {} exchange: {}",
            self.base.transport_id,
            exchange.kind.as_str(),
            exchange.name
        );
        self.exchange_declared = true;
        Ok(())
    }

    async fn do_publish(&mut self, routing_key: &str, payload: &[u8], opts: &PublishOptions) -> Result<()> {
        // ---
        self.ensure_exchange().await?;

        let mut props = BasicProperties::default().with_content_type(opts.content_type.as_str().into());
        if opts.persistent {
            props = props.with_delivery_mode(2);
        }
        if let Some(ttl) = opts.expiration {
            props = props.with_expiration(ttl.as_millis().to_string().as_str().into());
        }
        if let Some(priority) = opts.priority {
            props = props.with_priority(priority);
        }

        self.channel
            .basic_publish(
                self.base.exchange.name.as_str().into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                payload,
                props,
            )
            .await
            .map_err(|e| amqp_err("publish", e))?;

        log_debug!("[{}] Published with key: {routing_key}", self.base.transport_id);
        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        routing_key: String,
        handler: MessageHandler,
        opts: &SubscribeOptions,
    ) -> Result<ConsumerRef> {
        // ---
        self.ensure_exchange().await?;

        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.queue.options.durable,
            exclusive: opts.queue.options.exclusive,
            auto_delete: opts.queue.options.auto_delete,
            nowait: false,
        };

        let arguments = field_table(&opts.queue.options.arguments);

        let declared = self
            .channel
            .queue_declare(opts.queue.group_name().into(), queue_opts, arguments.clone())
            .await
            .map_err(|e| amqp_err("queue declare", e))?;
        let queue = declared.name().as_str().to_string();

        log_info!("[{}] Declared queue: {queue}", self.base.transport_id);

        self.channel
            .queue_bind(
                queue.as_str().into(),
                self.base.exchange.name.as_str().into(),
                routing_key.as_str().into(),
                QueueBindOptions::default(),
                arguments.clone(),
            )
            .await
            .map_err(|e| amqp_err("queue bind", e))?;

        let tag = match &opts.consume.consumer_tag {
            Some(tag) => tag.clone(),
            None => format!("{}-{}", self.base.transport_id, Uuid::new_v4().simple()),
        };
        let consume_opts = BasicConsumeOptions {
            no_ack: opts.consume.no_ack,
            exclusive: opts.consume.exclusive,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                tag.as_str().into(),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_err("consume", e))?;

        log_info!("[{}] Consuming queue {queue} for key {routing_key} ({tag})", self.base.transport_id);

        let handle = tokio::spawn(consume_loop(
            self.base.transport_id.clone(),
            consumer,
            routing_key.clone(),
            Arc::from(tag.as_str()),
            handler,
            !opts.consume.no_ack,
        ));
        self.consumers.insert(tag.clone(), handle);

        Ok(ConsumerRef {
            tag,
            queue,
            routing_key,
            arguments,
            unbind: opts.queue.unbind_on_dispose,
            delete: opts.queue.delete_on_dispose,
        })
    }

    async fn do_dispose(&mut self, consumer: ConsumerRef) -> Result<()> {
        // ---
        log_debug!("[{}] Cancelling consumer {}", self.base.transport_id, consumer.tag);

        if let Some(handle) = self.consumers.remove(&consumer.tag) {
            handle.abort();
        }

        self.channel
            .basic_cancel(consumer.tag.as_str().into(), BasicCancelOptions::default())
            .await
            .map_err(|e| amqp_err("cancel", e))?;

        if consumer.unbind {
            self.channel
                .queue_unbind(
                    consumer.queue.as_str().into(),
                    self.base.exchange.name.as_str().into(),
                    consumer.routing_key.as_str().into(),
                    consumer.arguments,
                )
                .await
                .map_err(|e| amqp_err("queue unbind", e))?;
        }

        if consumer.delete {
            self.channel
                .queue_delete(consumer.queue.as_str().into(), QueueDeleteOptions::default())
                .await
                .map_err(|e| amqp_err("queue delete", e))?;
        }
        Ok(())
    }
}

/// Delivery task for one consumer.
async fn consume_loop(
    transport_id: String,
    mut consumer: lapin::Consumer,
    routing_key: String,
    consumer_tag: Arc<str>,
    handler: MessageHandler,
    ack: bool,
) {
    // ---
    use futures_lite::stream::StreamExt;

    while let Some(delivery_result) = consumer.next().await {
        match delivery_result {
            Ok(delivery) => {
                log_debug!("[{transport_id}] Received message for key: {routing_key}");

                let raw = to_delivery(&delivery, &consumer_tag);
                let content = decode_content(&raw.payload);
                handler(&routing_key, &content, &raw);

                if ack {
                    if let Err(_e) = delivery.ack(BasicAckOptions::default()).await {
                        log_error!("[{transport_id}] Failed to ack message: {_e}");
                    }
                }
            }
            Err(_e) => {
                log_error!("[{transport_id}] Consumer error on {routing_key}: {_e}");
                break;
            }
        }
    }

    log_info!("[{transport_id}] Consumer task ended for key: {routing_key}");
}

fn to_delivery(delivery: &AmqpDelivery, consumer_tag: &Arc<str>) -> Delivery {
    // ---
    Delivery {
        exchange: delivery.exchange.as_str().into(),
        routing_key: delivery.routing_key.as_str().into(),
        payload: Bytes::copy_from_slice(&delivery.data),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().into()),
        redelivered: delivery.redelivered,
        delivery_tag: delivery.delivery_tag,
        consumer_tag: Arc::clone(consumer_tag),
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, routing_key: &str, payload: Bytes, opts: &PublishOptions) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        let cmd = Cmd::Publish {
            routing_key: routing_key.to_string(),
            payload,
            opts: opts.clone(),
            resp: tx,
        };
        request(&self.cmd_tx, cmd, rx).await
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        on_message: MessageHandler,
        opts: &SubscribeOptions,
    ) -> Result<Disposer> {
        // ---
        let (tx, rx) = oneshot::channel();
        let cmd = Cmd::Subscribe {
            routing_key: routing_key.to_string(),
            handler: on_message,
            opts: opts.clone(),
            resp: tx,
        };
        let consumer = request(&self.cmd_tx, cmd, rx).await?;

        let cmd_tx = self.cmd_tx.clone();
        Ok(Disposer::new(move || async move {
            let (tx, rx) = oneshot::channel();
            request(&cmd_tx, Cmd::Dispose { consumer, resp: tx }, rx).await
        }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        let handle = self.actor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(_e) = handle.await {
                log_warn!("[{}] AMQP actor ended abnormally: {_e}", self.base.transport_id);
            }
        }

        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - The broker URI is missing or cannot be parsed
/// - Connection to the broker fails
///
/// # Connection Behavior
///
/// The connection to the broker happens immediately during transport creation.
/// The exchange is declared lazily, on the first publish or subscribe.
pub async fn create_transport(config: &PubSubConfig) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(config).await?;
    Ok(AmqpTransport::create(TransportBase::from(config), connection, channel))
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &PubSubConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = config
        .transport_uri
        .as_deref()
        .ok_or_else(|| PubSubError::MissingConfig("AMQP transport requires transport_uri".to_string()))?;

    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            PubSubError::Transport(msg)
        })?;

    log_info!("Connected to AMQP broker");

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        PubSubError::Transport(msg)
    })?;

    log_info!("Created AMQP channel");

    Ok((connection, channel))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::QueueOptions;
    use lapin::types::ShortString;
    use serde_json::json;

    #[test]
    fn queue_arguments_become_field_table() {
        // ---
        let options = QueueOptions::default()
            .with_argument("x-message-ttl", 60_000)
            .with_argument("x-match", "all")
            .with_argument("x-ratio", 0.5)
            .with_argument("x-routes", json!(["a", true]));

        let table = field_table(&options.arguments);
        let inner = table.inner();

        assert_eq!(inner.len(), 4);
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString("all".into()))
        );
        assert_eq!(inner.get(&ShortString::from("x-ratio")), Some(&AMQPValue::Double(0.5)));
        assert!(matches!(
            inner.get(&ShortString::from("x-routes")),
            Some(AMQPValue::FieldArray(_))
        ));
    }

    #[test]
    fn no_arguments_means_empty_table() {
        let table = field_table(&QueueOptions::default().arguments);
        assert!(table.inner().is_empty());
    }
}
