use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use analyzer_utilities::Logger;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    consumer::{DeliverySource, Dispatcher, Outcome, ReaderGroup, Settlement},
    registry::HandlerRegistry,
    Envelope, Handler, Queue, QueueError, StatsSnapshot,
};

/// `type: in-memory` section.
#[derive(Debug, Clone, Deserialize)]
pub struct InMemoryConfig {
    #[serde(default = "default_timeout_sec")]
    pub handler_timeout_sec: u64,
    #[serde(default = "default_read_loop")]
    pub read_loop: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            handler_timeout_sec: default_timeout_sec(),
            read_loop: default_read_loop(),
        }
    }
}

fn default_timeout_sec() -> u64 {
    5
}

fn default_read_loop() -> usize {
    1
}

/// Message handed out by [`InMemoryBroker::poll`].
#[derive(Debug, Clone)]
pub struct InMemoryDelivery {
    pub delivery_id: Uuid,
    pub envelope: Envelope,
    /// Number of times this message has been handed out, this one included.
    pub attempts: u32,
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<InMemoryDelivery>,
    inflight: HashMap<Uuid, InMemoryDelivery>,
    dead_letters: Vec<InMemoryDelivery>,
    closed: bool,
}

/// Process-local broker with ack / nack-and-requeue semantics.
///
/// Clones share the same messages. Queues built on it with
/// [`InMemoryQueue::with_broker`] close it when the last of them closes.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    queues: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(QueueError::Publish {
                type_tag: envelope.type_tag,
                message: "in-memory broker is closed".into(),
            });
        }
        guard.queue.push_back(InMemoryDelivery {
            delivery_id: Uuid::new_v4(),
            envelope,
            attempts: 0,
        });
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next message; `None` once the broker is closed.
    pub async fn poll(&self) -> Option<InMemoryDelivery> {
        loop {
            // Registered before the state check so a close or publish in
            // between still wakes this waiter.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.state.lock();
                if guard.closed {
                    return None;
                }
                if let Some(mut delivery) = guard.queue.pop_front() {
                    delivery.attempts += 1;
                    guard
                        .inflight
                        .insert(delivery.delivery_id, delivery.clone());
                    return Some(delivery);
                }
            }

            notified.await;
        }
    }

    pub fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        match guard.inflight.remove(&delivery_id) {
            Some(_) => Ok(()),
            None => Err(unknown_delivery(delivery_id)),
        }
    }

    /// Returns the delivery to the head of the queue, or parks it in the
    /// dead-letter list when `requeue` is false.
    pub fn nack(&self, delivery_id: Uuid, requeue: bool) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        let Some(delivery) = guard.inflight.remove(&delivery_id) else {
            return Err(unknown_delivery(delivery_id));
        };
        if requeue {
            guard.queue.push_front(delivery);
            drop(guard);
            self.notify.notify_one();
        } else {
            guard.dead_letters.push(delivery);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn attach(&self) {
        self.queues.fetch_add(1, Ordering::SeqCst);
    }

    /// Closes the broker once no attached queue is left.
    fn detach(&self) {
        if self.queues.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn dead_letters(&self) -> Vec<InMemoryDelivery> {
        self.state.lock().dead_letters.clone()
    }
}

fn unknown_delivery(delivery_id: Uuid) -> QueueError {
    QueueError::Settle {
        position: delivery_id.to_string(),
        message: "delivery not found".into(),
    }
}

struct InMemorySource {
    broker: InMemoryBroker,
}

#[async_trait]
impl DeliverySource for InMemorySource {
    type Delivery = Uuid;

    async fn fetch(&self) -> Result<Option<(Envelope, Uuid)>, QueueError> {
        Ok(self
            .broker
            .poll()
            .await
            .map(|delivery| (delivery.envelope, delivery.delivery_id)))
    }

    async fn settle(&self, delivery_id: Uuid, outcome: &Outcome) -> Result<Settlement, QueueError> {
        match outcome {
            Outcome::Completed => {
                self.broker.ack(delivery_id)?;
                Ok(Settlement::Acked)
            }
            Outcome::UnknownType(_) => {
                self.broker.nack(delivery_id, false)?;
                Ok(Settlement::DeadLettered)
            }
            _ => {
                self.broker.nack(delivery_id, true)?;
                Ok(Settlement::Requeued)
            }
        }
    }
}

/// [`Queue`] over an [`InMemoryBroker`].
pub struct InMemoryQueue {
    broker: InMemoryBroker,
    dispatcher: Arc<Dispatcher>,
    readers: ReaderGroup,
    read_loop: usize,
    log: Logger,
}

impl InMemoryQueue {
    pub fn new(config: &InMemoryConfig, log: &Logger) -> Self {
        Self::with_broker(InMemoryBroker::new(), config, log)
    }

    /// Shares `broker` with other queues, e.g. a producer and a consumer in
    /// the same process. The broker stays open until every queue sharing it
    /// has been closed.
    pub fn with_broker(broker: InMemoryBroker, config: &InMemoryConfig, log: &Logger) -> Self {
        let log = log.named("in-memory");
        broker.attach();
        let dispatcher = Dispatcher::new(
            Arc::new(HandlerRegistry::new()),
            Duration::from_secs(config.handler_timeout_sec),
        );
        Self {
            broker,
            dispatcher: Arc::new(dispatcher),
            readers: ReaderGroup::new(log.clone()),
            read_loop: config.read_loop,
            log,
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn handle(&self, type_tag: &str, handler: Arc<dyn Handler>) {
        debug!(target: self.log.target(), "add handler function: {}", type_tag);
        self.dispatcher.registry().register(type_tag, handler);
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.broker.publish(envelope)
    }

    async fn read_start(&self) -> Result<(), QueueError> {
        let sources = (0..self.read_loop)
            .map(|_| InMemorySource {
                broker: self.broker.clone(),
            })
            .collect::<Vec<_>>();
        self.readers.start_readers(sources, &self.dispatcher)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.readers.close().await {
            self.broker.detach();
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nack_requeues_at_front_and_counts_attempts() {
        let broker = InMemoryBroker::new();
        broker.publish(Envelope::new("a", vec![1])).unwrap();
        broker.publish(Envelope::new("b", vec![2])).unwrap();

        let first = broker.poll().await.unwrap();
        assert_eq!(first.envelope.type_tag, "a");
        assert_eq!(first.attempts, 1);
        broker.nack(first.delivery_id, true).unwrap();

        let again = broker.poll().await.unwrap();
        assert_eq!(again.delivery_id, first.delivery_id);
        assert_eq!(again.attempts, 2);
        broker.ack(again.delivery_id).unwrap();

        assert!(broker.ack(again.delivery_id).is_err());
        assert_eq!(broker.pending(), 1);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.publish(Envelope::new("a", vec![1])).unwrap();
        let delivery = broker.poll().await.unwrap();
        broker.nack(delivery.delivery_id, false).unwrap();
        assert_eq!(broker.pending(), 0);
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn closed_broker_rejects_publish_and_ends_poll() {
        let broker = InMemoryBroker::new();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.poll().await })
        };
        tokio::task::yield_now().await;
        broker.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(broker.publish(Envelope::new("a", vec![])).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_poll_never_strands_the_waiter() {
        for _ in 0..200 {
            let broker = InMemoryBroker::new();
            let waiter = {
                let broker = broker.clone();
                tokio::spawn(async move { broker.poll().await })
            };
            broker.close();
            let polled = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("poll missed the close notification")
                .unwrap();
            assert!(polled.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publish_racing_poll_is_always_delivered() {
        for round in 0..200u8 {
            let broker = InMemoryBroker::new();
            let waiter = {
                let broker = broker.clone();
                tokio::spawn(async move { broker.poll().await })
            };
            broker.publish(Envelope::new("a", vec![round])).unwrap();
            let polled = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("poll missed the publish notification")
                .unwrap();
            assert_eq!(polled.map(|delivery| delivery.envelope.payload), Some(vec![round]));
        }
    }

    #[tokio::test]
    async fn shared_broker_closes_with_the_last_queue() {
        let log = Logger::new("test");
        let broker = InMemoryBroker::new();
        let producer = InMemoryQueue::with_broker(broker.clone(), &InMemoryConfig::default(), &log);
        let consumer = InMemoryQueue::with_broker(broker.clone(), &InMemoryConfig::default(), &log);

        producer.close().await.unwrap();
        consumer.publish(Envelope::new("a", vec![1])).await.unwrap();

        consumer.close().await.unwrap();
        assert!(broker.publish(Envelope::new("a", vec![2])).is_err());
    }
}
