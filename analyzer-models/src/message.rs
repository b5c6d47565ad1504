use serde::{de::DeserializeOwned, Serialize};

/// A payload kind that can travel through a queue.
///
/// `TYPE_TAG` is the routing key written next to the serialized payload
/// (Kafka record key, AMQP `type` property) and used to pick the handler on
/// the consuming side. It must stay stable across releases.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}
