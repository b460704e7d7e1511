//! Message bus seam.
//!
//! The signing protocol only needs two primitives: publish one message to a
//! topic, and consume from a transient queue bound to a topic. Everything
//! else (credentials, exchanges, reconnects) stays behind [`BusConnection`].
//! The AMQP binding lives in [`amqp`]; [`memory`] provides an in-process
//! broker for tests.
//!
//! Publish and consume run under different trust scopes, so a run always
//! holds two independently constructed connections that share no client
//! state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Result, SignError};

/// A live connection to the bus, scoped to one credential set.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Publish one flat string-keyed body to `topic`.
    async fn publish(&self, topic: &str, body: &Value) -> Result<()>;

    /// Bind a uniquely named, non-durable, auto-delete, exclusive queue to
    /// `topic` and start consuming.
    ///
    /// Implementations must not return before the broker has acknowledged
    /// the binding: the caller treats a returned [`Subscription`] as the
    /// "registered" point after which a reply cannot be lost.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// A consuming side of a transient queue.
pub struct Subscription {
    queue: String,
    inbound: mpsc::Receiver<Map<String, Value>>,
}

impl Subscription {
    /// Assemble a subscription from a queue name and a delivery channel.
    #[must_use]
    pub fn new(queue: String, inbound: mpsc::Receiver<Map<String, Value>>) -> Self {
        Self { queue, inbound }
    }

    /// Broker-assigned (unique) queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next inbound body; `None` once the transport is gone. Queues are
    /// non-replayable, so `None` is terminal.
    pub async fn next(&mut self) -> Option<Map<String, Value>> {
        self.inbound.recv().await
    }
}

pub mod amqp {
    //! AMQP 0.9.1 binding over a topic exchange.

    use futures_util::StreamExt;
    use lapin::options::{
        BasicConsumeOptions, BasicPublishOptions, QueueBindOptions, QueueDeclareOptions,
    };
    use lapin::types::FieldTable;
    use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

    use super::{
        Arc, BusConnection, Result, SignError, Subscription, Value, async_trait, mpsc, warn,
    };

    /// One AMQP connection plus the topic exchange it talks to.
    pub struct AmqpConnection {
        channel: Channel,
        exchange: String,
        // Kept alive for the lifetime of the channel.
        _connection: Arc<Connection>,
    }

    impl AmqpConnection {
        /// Connect and open a channel.
        ///
        /// # Errors
        ///
        /// Returns [`SignError::Transport`] when the broker is unreachable
        /// or refuses the channel.
        pub async fn connect(url: &str, exchange: &str) -> Result<Self> {
            let connection = Connection::connect(url, ConnectionProperties::default())
                .await
                .map_err(transport)?;
            let channel = connection.create_channel().await.map_err(transport)?;
            Ok(Self {
                channel,
                exchange: exchange.to_string(),
                _connection: Arc::new(connection),
            })
        }
    }

    fn transport(err: lapin::Error) -> SignError {
        SignError::Transport(err.to_string())
    }

    #[async_trait]
    impl BusConnection for AmqpConnection {
        async fn publish(&self, topic: &str, body: &Value) -> Result<()> {
            let payload = serde_json::to_vec(body)
                .map_err(|e| SignError::Transport(format!("unencodable body: {e}")))?;
            self.channel
                .basic_publish(
                    &self.exchange,
                    topic,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type("application/json".to_string().into()),
                )
                .await
                .map_err(transport)?
                .await
                .map_err(transport)?;
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription> {
            let queue_name = format!("forgesign-{}", uuid::Uuid::new_v4());
            let declare = QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            };
            self.channel
                .queue_declare(&queue_name, declare, FieldTable::default())
                .await
                .map_err(transport)?;
            // queue_bind resolving is the broker's binding ack; only after
            // this point is the subscription registered.
            self.channel
                .queue_bind(
                    &queue_name,
                    &self.exchange,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transport)?;
            let mut consumer = self
                .channel
                .basic_consume(
                    &queue_name,
                    "forgesign",
                    BasicConsumeOptions {
                        no_ack: true,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(transport)?;

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(err) => {
                            warn!(%err, "consumer stream error; stopping");
                            break;
                        },
                    };
                    match serde_json::from_slice::<Value>(&delivery.data) {
                        Ok(Value::Object(body)) => {
                            if tx.send(body).await.is_err() {
                                break;
                            }
                        },
                        Ok(_) | Err(_) => {
                            warn!("discarding non-object message body");
                        },
                    }
                }
            });

            Ok(Subscription::new(queue_name, rx))
        }
    }
}

pub mod memory {
    //! In-process broker used by tests.
    //!
    //! Topic matching is exact. Messages published to a topic with no bound
    //! queue are dropped, exactly like a transient, non-replayable broker
    //! queue that does not exist yet.

    use super::{
        Arc, BusConnection, HashMap, Map, Mutex, Result, SignError, Subscription, Value,
        async_trait, mpsc,
    };

    type Registry = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Map<String, Value>>>>>>;

    /// Shared broker state. Cheap to clone.
    #[derive(Clone, Default)]
    pub struct MemoryBus {
        topics: Registry,
        counter: Arc<Mutex<u64>>,
    }

    impl MemoryBus {
        /// Fresh broker with no bindings.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Open an independent connection to this broker.
        #[must_use]
        pub fn connect(&self) -> MemoryConnection {
            MemoryConnection { bus: self.clone() }
        }
    }

    /// One connection to a [`MemoryBus`].
    pub struct MemoryConnection {
        bus: MemoryBus,
    }

    #[async_trait]
    impl BusConnection for MemoryConnection {
        async fn publish(&self, topic: &str, body: &Value) -> Result<()> {
            let Value::Object(body) = body else {
                return Err(SignError::Transport("message body must be an object".into()));
            };
            let senders: Vec<_> = {
                let topics = self.bus.topics.lock().expect("bus registry poisoned");
                topics.get(topic).cloned().unwrap_or_default()
            };
            for sender in senders {
                // A dropped receiver models an auto-deleted queue.
                let _ = sender.send(body.clone()).await;
            }
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription> {
            let (tx, rx) = mpsc::channel(16);
            let queue = {
                let mut counter = self.bus.counter.lock().expect("bus counter poisoned");
                *counter += 1;
                format!("forgesign-mem-{}", *counter)
            };
            // Binding is registered before subscribe returns; a publish
            // sequenced after this call can never miss the queue.
            self.bus
                .topics
                .lock()
                .expect("bus registry poisoned")
                .entry(topic.to_string())
                .or_default()
                .push(tx);
            Ok(Subscription::new(queue, rx))
        }
    }

}
