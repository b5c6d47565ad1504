//! Work-queue backend on top of `lapin`.
//!
//! Every message goes through the default exchange to one durable queue. The
//! type tag travels in the AMQP `type` property. Each reader loop gets its own
//! channel and consumer with a prefetch window, all opened before
//! `read_start` returns. Readers ack on success and nack with requeue on
//! handler failure or timeout. Messages without a registered handler are
//! nacked without requeue, which drops them or routes them to the queue's
//! dead-letter exchange when one is set up on the broker.

use serde::Deserialize;

use crate::QueueError;

#[cfg(feature = "rabbitmq")]
pub use self::client::RabbitMqQueue;

/// `type: rabbitmq` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    pub url: String,
    pub queue_name: String,
    #[serde(default = "default_handler_timeout_sec")]
    pub handler_timeout_sec: u64,
    #[serde(default = "default_read_loop")]
    pub read_loop: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

fn default_handler_timeout_sec() -> u64 {
    5
}

fn default_read_loop() -> usize {
    1
}

fn default_prefetch() -> u16 {
    1
}

impl RabbitMqConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.url.trim().is_empty() {
            return Err(invalid("url is empty"));
        }
        if !(self.url.starts_with("amqp://") || self.url.starts_with("amqps://")) {
            return Err(invalid("url must use the amqp:// or amqps:// scheme"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(invalid("queue_name is empty"));
        }
        if self.handler_timeout_sec == 0 {
            return Err(invalid("handler_timeout_sec must be greater than 0"));
        }
        if self.prefetch == 0 {
            return Err(invalid("prefetch must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> QueueError {
    QueueError::Config(format!("rabbitmq: {message}"))
}

#[cfg(feature = "rabbitmq")]
mod client {
    use std::{sync::Arc, time::Duration};

    use analyzer_utilities::Logger;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use lapin::{
        acker::Acker,
        options::{
            BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
            BasicQosOptions, QueueDeclareOptions,
        },
        types::{FieldTable, ShortString},
        BasicProperties, Channel, Connection, ConnectionProperties,
    };
    use log::{debug, error, info};

    use super::RabbitMqConfig;
    use crate::{
        consumer::{open_sources, DeliverySource, Dispatcher, Outcome, ReaderGroup, Settlement},
        registry::HandlerRegistry,
        Envelope, Handler, Queue, QueueError, StatsSnapshot,
    };

    const REPLY_SUCCESS: u16 = 200;

    pub(super) fn publish_properties(type_tag: &str) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from("text/plain"))
            .with_kind(ShortString::from(type_tag))
    }

    /// `None` acks; `Some(requeue)` nacks.
    pub(super) fn nack_requeue(outcome: &Outcome) -> Option<bool> {
        match outcome {
            Outcome::Completed => None,
            Outcome::UnknownType(_) => Some(false),
            Outcome::Failed(_) | Outcome::Panicked | Outcome::TimedOut(_) => Some(true),
        }
    }

    fn connect_error(err: lapin::Error) -> QueueError {
        QueueError::Connect {
            backend: "rabbitmq",
            message: err.to_string(),
        }
    }

    fn close_error(err: lapin::Error) -> QueueError {
        QueueError::Close {
            backend: "rabbitmq",
            message: err.to_string(),
        }
    }

    async fn declare_queue(channel: &Channel, queue_name: &str) -> Result<(), QueueError> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(connect_error)
    }

    pub(super) struct AmqpDelivery {
        acker: Acker,
        delivery_tag: u64,
    }

    struct RabbitMqSource {
        channel: Channel,
        consumer: tokio::sync::Mutex<lapin::Consumer>,
        log: Logger,
    }

    impl RabbitMqSource {
        async fn open(
            connection: &Connection,
            queue_name: &str,
            prefetch: u16,
            consumer_tag: &str,
            log: Logger,
        ) -> Result<Self, QueueError> {
            let channel = connection.create_channel().await.map_err(connect_error)?;
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(connect_error)?;
            let consumer = channel
                .basic_consume(
                    queue_name,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(connect_error)?;
            Ok(Self {
                channel,
                consumer: tokio::sync::Mutex::new(consumer),
                log,
            })
        }
    }

    #[async_trait]
    impl DeliverySource for RabbitMqSource {
        type Delivery = AmqpDelivery;

        async fn fetch(&self) -> Result<Option<(Envelope, AmqpDelivery)>, QueueError> {
            let mut consumer = self.consumer.lock().await;
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    let type_tag = delivery
                        .properties
                        .kind()
                        .as_ref()
                        .map(|kind| kind.as_str().to_string())
                        .unwrap_or_default();
                    let envelope = Envelope::new(type_tag, delivery.data);
                    Ok(Some((
                        envelope,
                        AmqpDelivery {
                            acker: delivery.acker,
                            delivery_tag: delivery.delivery_tag,
                        },
                    )))
                }
                Some(Err(err)) => Err(QueueError::Fetch(err.to_string())),
                None => Ok(None),
            }
        }

        async fn settle(
            &self,
            delivery: AmqpDelivery,
            outcome: &Outcome,
        ) -> Result<Settlement, QueueError> {
            let settle_error = |err: lapin::Error| QueueError::Settle {
                position: format!("delivery-tag {}", delivery.delivery_tag),
                message: err.to_string(),
            };
            match nack_requeue(outcome) {
                None => {
                    delivery
                        .acker
                        .ack(BasicAckOptions::default())
                        .await
                        .map_err(settle_error)?;
                    Ok(Settlement::Acked)
                }
                Some(requeue) => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue,
                            ..BasicNackOptions::default()
                        })
                        .await
                        .map_err(settle_error)?;
                    Ok(if requeue {
                        Settlement::Requeued
                    } else {
                        Settlement::DeadLettered
                    })
                }
            }
        }

        async fn finish(&self) {
            if !self.channel.status().connected() {
                return;
            }
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "reader stopped").await {
                error!(target: self.log.target(), "close reader channel: {}", err);
            }
        }
    }

    /// [`Queue`] over one durable RabbitMQ queue.
    pub struct RabbitMqQueue {
        connection: Arc<Connection>,
        channel: Channel,
        queue_name: String,
        prefetch: u16,
        read_loop: usize,
        dispatcher: Arc<Dispatcher>,
        readers: ReaderGroup,
        log: Logger,
    }

    impl RabbitMqQueue {
        /// Opens the connection, a publish channel, and declares the queue.
        pub async fn connect(config: &RabbitMqConfig, log: &Logger) -> Result<Self, QueueError> {
            let log = log.named("rabbitmq");
            let connection = Connection::connect(&config.url, ConnectionProperties::default())
                .await
                .map_err(connect_error)?;
            let channel = connection.create_channel().await.map_err(connect_error)?;
            declare_queue(&channel, &config.queue_name).await?;
            info!(
                target: log.target(),
                "connected, queue '{}' declared", config.queue_name
            );

            Ok(Self {
                connection: Arc::new(connection),
                channel,
                queue_name: config.queue_name.clone(),
                prefetch: config.prefetch,
                read_loop: config.read_loop,
                dispatcher: Arc::new(Dispatcher::new(
                    Arc::new(HandlerRegistry::new()),
                    Duration::from_secs(config.handler_timeout_sec),
                )),
                readers: ReaderGroup::new(log.clone()),
                log,
            })
        }
    }

    #[async_trait]
    impl Queue for RabbitMqQueue {
        fn handle(&self, type_tag: &str, handler: Arc<dyn Handler>) {
            debug!(target: self.log.target(), "add handler function: {}", type_tag);
            self.dispatcher.registry().register(type_tag, handler);
        }

        async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
            let publish_error = |err: lapin::Error| QueueError::Publish {
                type_tag: envelope.type_tag.clone(),
                message: err.to_string(),
            };
            self.channel
                .basic_publish(
                    "",
                    &self.queue_name,
                    BasicPublishOptions::default(),
                    &envelope.payload,
                    publish_properties(&envelope.type_tag),
                )
                .await
                .map_err(publish_error)?
                .await
                .map(|_| ())
                .map_err(publish_error)
        }

        async fn read_start(&self) -> Result<(), QueueError> {
            self.readers.ensure_idle()?;
            let sources = open_sources(self.read_loop, |index| {
                let consumer_tag = format!("{}-reader-{}", self.queue_name, index);
                let log = self.log.named("read").named(index);
                async move {
                    RabbitMqSource::open(
                        &self.connection,
                        &self.queue_name,
                        self.prefetch,
                        &consumer_tag,
                        log,
                    )
                    .await
                }
            })
            .await
            .inspect_err(|err| error!(target: self.log.target(), "open reader channel: {}", err))?;
            self.readers.start_readers(sources, &self.dispatcher)
        }

        async fn close(&self) -> Result<(), QueueError> {
            if !self.readers.close().await {
                return Ok(());
            }
            if self.channel.status().connected() {
                self.channel
                    .close(REPLY_SUCCESS, "closing")
                    .await
                    .map_err(close_error)?;
            }
            if self.connection.status().connected() {
                self.connection
                    .close(REPLY_SUCCESS, "closing")
                    .await
                    .map_err(close_error)?;
            }
            info!(target: self.log.target(), "closed");
            Ok(())
        }

        fn stats(&self) -> StatsSnapshot {
            self.dispatcher.stats().snapshot()
        }
    }
}
