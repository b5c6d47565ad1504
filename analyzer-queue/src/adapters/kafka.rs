//! Partitioned-log backend on top of `rdkafka`.
//!
//! Records carry the type tag as key and the JSON payload as value. Offsets
//! are committed manually once a record has been dealt with, and only up to
//! the oldest record of the partition that is still in flight, since several
//! reader loops share one consumer. A record whose handler fails, times out
//! or is missing is first copied to the dead-letter topic (always written
//! with `acks=all`) and only then marked done; if that copy cannot be written
//! the record is never marked, the commit position stays below it and every
//! reader loop halts, so it is fetched again after a restart or rebalance.

use serde::Deserialize;

use crate::QueueError;

#[cfg(feature = "kafka")]
pub use self::client::KafkaQueue;

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub reader: Option<KafkaReaderConfig>,
    pub writer: Option<KafkaWriterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaReaderConfig {
    pub group_id: String,
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default = "default_handler_timeout_sec")]
    pub handler_timeout_sec: u64,
    #[serde(default = "default_read_loop")]
    pub read_loop: usize,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

impl KafkaReaderConfig {
    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dead-letter", self.topic))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaWriterConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub acks: RequiredAcks,
    #[serde(default = "default_send_timeout_sec")]
    pub send_timeout_sec: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    None,
    One,
    #[default]
    All,
}

impl RequiredAcks {
    /// Value for the librdkafka `acks` property.
    pub fn as_config_value(self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::One => "1",
            RequiredAcks::All => "all",
        }
    }
}

fn default_handler_timeout_sec() -> u64 {
    5
}

fn default_read_loop() -> usize {
    1
}

fn default_send_timeout_sec() -> u64 {
    10
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.reader.is_none() && self.writer.is_none() {
            return Err(invalid("at least one of reader or writer is required"));
        }
        if let Some(reader) = &self.reader {
            require_brokers(&reader.brokers, "reader")?;
            if reader.topic.trim().is_empty() {
                return Err(invalid("reader.topic is empty"));
            }
            if reader.group_id.trim().is_empty() {
                return Err(invalid("reader.group_id is empty"));
            }
            if reader.handler_timeout_sec == 0 {
                return Err(invalid("reader.handler_timeout_sec must be greater than 0"));
            }
            if reader.dead_letter_topic() == reader.topic {
                return Err(invalid("reader.dead_letter_topic must differ from reader.topic"));
            }
        }
        if let Some(writer) = &self.writer {
            require_brokers(&writer.brokers, "writer")?;
            if writer.topic.trim().is_empty() {
                return Err(invalid("writer.topic is empty"));
            }
        }
        Ok(())
    }
}

fn require_brokers(brokers: &[String], side: &str) -> Result<(), QueueError> {
    if brokers.iter().all(|broker| broker.trim().is_empty()) {
        return Err(invalid(&format!("{side}.brokers is empty")));
    }
    Ok(())
}

fn invalid(message: &str) -> QueueError {
    QueueError::Config(format!("kafka: {message}"))
}

#[cfg(feature = "kafka")]
mod client {
    use std::{sync::Arc, time::Duration};

    use analyzer_utilities::Logger;
    use async_trait::async_trait;
    use log::{debug, info};
    use rdkafka::{
        consumer::{CommitMode, Consumer, StreamConsumer},
        message::{Header, Message as _, OwnedHeaders},
        producer::{FutureProducer, FutureRecord, Producer},
        ClientConfig, Offset, TopicPartitionList,
    };

    use super::{KafkaConfig, KafkaReaderConfig, KafkaWriterConfig, RequiredAcks};
    use crate::{
        consumer::{DeliverySource, Dispatcher, Outcome, ReaderGroup, Settlement},
        offsets::OffsetTracker,
        registry::HandlerRegistry,
        Envelope, Handler, Queue, QueueError, StatsSnapshot,
    };

    const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

    pub(super) fn consumer_config(reader: &KafkaReaderConfig) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", reader.brokers.join(","))
            .set("group.id", &reader.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "false")
            .set("session.timeout.ms", "45000");
        config
    }

    pub(super) fn producer_config(
        brokers: &[String],
        acks: RequiredAcks,
        send_timeout: Duration,
    ) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", acks.as_config_value())
            .set("allow.auto.create.topics", "false")
            .set("message.timeout.ms", send_timeout.as_millis().to_string());
        config
    }

    /// Dead-letter copies gate the source commit, so they always wait for
    /// every in-sync replica regardless of the writer's `acks`.
    pub(super) fn dead_letter_producer_config(reader: &KafkaReaderConfig) -> ClientConfig {
        producer_config(
            &reader.brokers,
            RequiredAcks::All,
            Duration::from_secs(super::default_send_timeout_sec()),
        )
    }

    /// Position of a fetched record, owned so it can outlive the borrow of
    /// the consumer.
    pub(super) struct KafkaDelivery {
        pub topic: String,
        pub partition: i32,
        pub offset: i64,
        pub key: Option<Vec<u8>>,
        pub payload: Vec<u8>,
    }

    impl KafkaDelivery {
        pub fn position(&self) -> String {
            format!("{}/{}@{}", self.topic, self.partition, self.offset)
        }
    }

    pub(super) fn dead_letter_headers(
        delivery: &KafkaDelivery,
        reason: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("x-failure-reason", reason.to_string()),
            ("x-source-topic", delivery.topic.clone()),
            ("x-source-partition", delivery.partition.to_string()),
            ("x-source-offset", delivery.offset.to_string()),
        ]
    }

    #[derive(Clone)]
    struct Writer {
        producer: FutureProducer,
        topic: String,
        send_timeout: Duration,
    }

    impl Writer {
        fn create(config: &ClientConfig, topic: String, send_timeout: Duration) -> Result<Self, QueueError> {
            let producer = config.create::<FutureProducer>().map_err(connect_error)?;
            Ok(Self {
                producer,
                topic,
                send_timeout,
            })
        }

        async fn send_dead_letter(
            &self,
            delivery: &KafkaDelivery,
            reason: &str,
        ) -> Result<(), QueueError> {
            let values = dead_letter_headers(delivery, reason);
            let headers = values.iter().fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_bytes()),
                })
            });

            let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&self.topic)
                .payload(delivery.payload.as_slice())
                .headers(headers);
            if let Some(key) = &delivery.key {
                record = record.key(key.as_slice());
            }

            self.producer
                .send(record, self.send_timeout)
                .await
                .map(|_| ())
                .map_err(|(err, _)| QueueError::DeadLetter {
                    position: delivery.position(),
                    message: err.to_string(),
                })
        }

        async fn flush(&self) -> Result<(), QueueError> {
            let producer = self.producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
                .await
                .map_err(|err| close_error(err.to_string()))?
                .map_err(|err| close_error(err.to_string()))
        }
    }

    fn connect_error(err: rdkafka::error::KafkaError) -> QueueError {
        QueueError::Connect {
            backend: "kafka",
            message: err.to_string(),
        }
    }

    fn close_error(message: String) -> QueueError {
        QueueError::Close {
            backend: "kafka",
            message,
        }
    }

    struct KafkaSource {
        consumer: Arc<StreamConsumer>,
        dead_letter: Writer,
        offsets: Arc<OffsetTracker>,
    }

    impl KafkaSource {
        fn commit(&self, delivery: &KafkaDelivery, next: i64) -> Result<(), QueueError> {
            let settle_error = |err: rdkafka::error::KafkaError| QueueError::Settle {
                position: delivery.position(),
                message: err.to_string(),
            };
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    &delivery.topic,
                    delivery.partition,
                    Offset::Offset(next),
                )
                .map_err(settle_error)?;
            self.consumer
                .commit(&offsets, CommitMode::Async)
                .map_err(settle_error)
        }
    }

    #[async_trait]
    impl DeliverySource for KafkaSource {
        type Delivery = KafkaDelivery;

        async fn fetch(&self) -> Result<Option<(Envelope, KafkaDelivery)>, QueueError> {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|err| QueueError::Fetch(err.to_string()))?;
            let delivery = KafkaDelivery {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            };
            self.offsets
                .begin(&delivery.topic, delivery.partition, delivery.offset);
            let type_tag = delivery
                .key
                .as_deref()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .unwrap_or_default();
            let envelope = Envelope::new(type_tag, delivery.payload.clone());
            Ok(Some((envelope, delivery)))
        }

        async fn settle(
            &self,
            delivery: KafkaDelivery,
            outcome: &Outcome,
        ) -> Result<Settlement, QueueError> {
            let settlement = if outcome.is_success() {
                Settlement::Acked
            } else {
                self.dead_letter
                    .send_dead_letter(&delivery, &outcome.reason())
                    .await?;
                Settlement::DeadLettered
            };
            if let Some(next) =
                self.offsets
                    .complete(&delivery.topic, delivery.partition, delivery.offset)
            {
                self.commit(&delivery, next)?;
            }
            Ok(settlement)
        }
    }

    struct ReadSide {
        consumer: Arc<StreamConsumer>,
        dead_letter: Writer,
        offsets: Arc<OffsetTracker>,
        read_loop: usize,
    }

    /// [`Queue`] over a Kafka consumer group and producer.
    pub struct KafkaQueue {
        read_side: Option<ReadSide>,
        writer: Option<Writer>,
        dispatcher: Arc<Dispatcher>,
        readers: ReaderGroup,
        log: Logger,
    }

    impl KafkaQueue {
        /// Creates the producer and joins the consumer group.
        pub fn new(config: &KafkaConfig, log: &Logger) -> Result<Self, QueueError> {
            let log = log.named("kafka");

            let writer = match &config.writer {
                Some(writer) => Some(build_writer(writer)?),
                None => None,
            };

            let read_side = match &config.reader {
                Some(reader) => {
                    let consumer: StreamConsumer =
                        consumer_config(reader).create().map_err(connect_error)?;
                    consumer
                        .subscribe(&[reader.topic.as_str()])
                        .map_err(connect_error)?;
                    info!(
                        target: log.target(),
                        "joined group '{}' on topic '{}'", reader.group_id, reader.topic
                    );

                    let dead_letter = Writer::create(
                        &dead_letter_producer_config(reader),
                        reader.dead_letter_topic(),
                        Duration::from_secs(super::default_send_timeout_sec()),
                    )?;

                    Some(ReadSide {
                        consumer: Arc::new(consumer),
                        dead_letter,
                        offsets: Arc::new(OffsetTracker::new()),
                        read_loop: reader.read_loop,
                    })
                }
                None => None,
            };

            let handler_timeout = config
                .reader
                .as_ref()
                .map(|reader| reader.handler_timeout_sec)
                .unwrap_or_else(super::default_handler_timeout_sec);

            Ok(Self {
                read_side,
                writer,
                dispatcher: Arc::new(Dispatcher::new(
                    Arc::new(HandlerRegistry::new()),
                    Duration::from_secs(handler_timeout),
                )),
                readers: ReaderGroup::new(log.clone()),
                log,
            })
        }
    }

    fn build_writer(writer: &KafkaWriterConfig) -> Result<Writer, QueueError> {
        let send_timeout = Duration::from_secs(writer.send_timeout_sec);
        Writer::create(
            &producer_config(&writer.brokers, writer.acks, send_timeout),
            writer.topic.clone(),
            send_timeout,
        )
    }

    #[async_trait]
    impl Queue for KafkaQueue {
        fn handle(&self, type_tag: &str, handler: Arc<dyn Handler>) {
            debug!(target: self.log.target(), "add handler function: {}", type_tag);
            self.dispatcher.registry().register(type_tag, handler);
        }

        async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
            let writer = self.writer.as_ref().ok_or(QueueError::WriterNotConfigured)?;
            let record = FutureRecord::to(&writer.topic)
                .key(envelope.type_tag.as_str())
                .payload(envelope.payload.as_slice());
            writer
                .producer
                .send(record, writer.send_timeout)
                .await
                .map(|_| ())
                .map_err(|(err, _)| QueueError::Publish {
                    type_tag: envelope.type_tag.clone(),
                    message: err.to_string(),
                })
        }

        async fn read_start(&self) -> Result<(), QueueError> {
            let Some(read_side) = &self.read_side else {
                info!(target: self.log.target(), "no reader configured, not consuming");
                return Ok(());
            };
            let sources = (0..read_side.read_loop)
                .map(|_| KafkaSource {
                    consumer: Arc::clone(&read_side.consumer),
                    dead_letter: read_side.dead_letter.clone(),
                    offsets: Arc::clone(&read_side.offsets),
                })
                .collect::<Vec<_>>();
            self.readers.start_readers(sources, &self.dispatcher)
        }

        async fn close(&self) -> Result<(), QueueError> {
            if !self.readers.close().await {
                return Ok(());
            }
            if let Some(read_side) = &self.read_side {
                read_side.consumer.unsubscribe();
                read_side.dead_letter.flush().await?;
            }
            if let Some(writer) = &self.writer {
                writer.flush().await?;
            }
            info!(target: self.log.target(), "closed");
            Ok(())
        }

        fn stats(&self) -> StatsSnapshot {
            self.dispatcher.stats().snapshot()
        }
    }
}
