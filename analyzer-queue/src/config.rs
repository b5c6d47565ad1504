//! Declarative queue configuration and the factory that turns it into a
//! running backend.
//!
//! Decoding only reads the `type` tag and the matching section; it never
//! touches the network. [`QueueConfig::build`] is the separate step that
//! connects, so configuration errors and connectivity errors stay distinct.

use std::sync::Arc;

use analyzer_utilities::Logger;
use log::info;
use serde::Deserialize;

use crate::{
    adapters::{kafka::KafkaConfig, rabbitmq::RabbitMqConfig},
    in_memory::{InMemoryConfig, InMemoryQueue},
    Queue, QueueError,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum QueueConfig {
    #[serde(rename = "kafka", alias = "partitioned-log")]
    Kafka(KafkaConfig),
    #[serde(rename = "rabbitmq", alias = "amqp-queue")]
    RabbitMq(RabbitMqConfig),
    #[serde(rename = "in-memory")]
    InMemory(InMemoryConfig),
}

impl QueueConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueConfig::Kafka(_) => "kafka",
            QueueConfig::RabbitMq(_) => "rabbitmq",
            QueueConfig::InMemory(_) => "in-memory",
        }
    }

    /// Checks values that decoding alone cannot reject.
    pub fn validate(&self) -> Result<(), QueueError> {
        match self {
            QueueConfig::Kafka(config) => config.validate(),
            QueueConfig::RabbitMq(config) => config.validate(),
            QueueConfig::InMemory(config) => {
                if config.handler_timeout_sec == 0 {
                    return Err(QueueError::Config(
                        "in-memory: handler_timeout_sec must be greater than 0".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Validates the configuration and connects the selected backend.
    pub async fn build(&self, log: &Logger) -> Result<Arc<dyn Queue>, QueueError> {
        self.validate()?;
        info!(target: log.target(), "building {} queue", self.kind());
        match self {
            QueueConfig::Kafka(config) => build_kafka(config, log),
            QueueConfig::RabbitMq(config) => build_rabbitmq(config, log).await,
            QueueConfig::InMemory(config) => Ok(Arc::new(InMemoryQueue::new(config, log))),
        }
    }
}

#[cfg(feature = "kafka")]
fn build_kafka(config: &KafkaConfig, log: &Logger) -> Result<Arc<dyn Queue>, QueueError> {
    Ok(Arc::new(crate::adapters::kafka::KafkaQueue::new(config, log)?))
}

#[cfg(not(feature = "kafka"))]
fn build_kafka(_config: &KafkaConfig, _log: &Logger) -> Result<Arc<dyn Queue>, QueueError> {
    Err(QueueError::Config(
        "kafka support is not compiled in (enable the `kafka` feature)".into(),
    ))
}

#[cfg(feature = "rabbitmq")]
async fn build_rabbitmq(
    config: &RabbitMqConfig,
    log: &Logger,
) -> Result<Arc<dyn Queue>, QueueError> {
    Ok(Arc::new(
        crate::adapters::rabbitmq::RabbitMqQueue::connect(config, log).await?,
    ))
}

#[cfg(not(feature = "rabbitmq"))]
async fn build_rabbitmq(
    _config: &RabbitMqConfig,
    _log: &Logger,
) -> Result<Arc<dyn Queue>, QueueError> {
    Err(QueueError::Config(
        "rabbitmq support is not compiled in (enable the `rabbitmq` feature)".into(),
    ))
}
