use std::sync::Arc;

use analyzer_database::EventDatabase;
use analyzer_models::{
    Event,
    errors::{RuntimeError, SendableError},
};
use analyzer_queue::{HandlerResult, Invocation, Queue, QueueExt};
use analyzer_utilities::Logger;
use log::{debug, warn};

/// Persists every [`Event`] delivered by the queue.
pub struct EventHandler {
    db: Arc<dyn EventDatabase>,
    log: Logger,
}

impl EventHandler {
    pub fn new(db: Arc<dyn EventDatabase>, log: &Logger) -> Self {
        Self {
            db,
            log: log.named("handler"),
        }
    }

    /// Registers the handler for `Event` and starts the reader loops.
    pub async fn start(self, queue: &dyn Queue) -> Result<(), SendableError> {
        let handler = Arc::new(self);
        queue.handle_message::<Event, _, _>(move |invocation| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(invocation).await }
        });
        queue
            .read_start()
            .await
            .map_err(|err| RuntimeError::boxed("worker.queue.read_start", err))
    }

    /// Decodes the payload and inserts it, giving up once the invocation is
    /// cancelled.
    pub async fn handle(&self, invocation: Invocation) -> HandlerResult {
        let event: Event = invocation
            .decode()
            .map_err(|err| RuntimeError::boxed("worker.event.decode", err))?;

        tokio::select! {
            inserted = self.db.insert(&event) => {
                inserted.map_err(|err| RuntimeError::boxed("worker.event.insert", err))?;
            }
            _ = invocation.cancellation().cancelled() => {
                warn!(target: self.log.target(), "insert abandoned after deadline: id={}", event.id());
                return Err(RuntimeError::boxed(
                    "worker.event.cancelled",
                    format!("insert of {} abandoned", event.id()),
                ));
            }
        }
        debug!(target: self.log.target(), "stored event id={}", event.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_database::{DatabaseError, memory::MemoryDb};
    use analyzer_models::EventType;
    use analyzer_queue::{
        CancellationToken, Envelope,
        in_memory::{InMemoryConfig, InMemoryQueue},
    };
    use async_trait::async_trait;
    use serde_json::value::RawValue;
    use std::time::Duration;

    fn sample() -> Event {
        Event::new(
            EventType::USER,
            "purchase",
            Some("user-9".into()),
            RawValue::from_string(r#"{"amount":12}"#.to_string()).unwrap(),
        )
    }

    async fn settle(queue: &InMemoryQueue, done: impl Fn(&analyzer_queue::StatsSnapshot) -> bool) {
        for _ in 0..500 {
            if done(&queue.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not settle: {:?}", queue.stats());
    }

    #[tokio::test]
    async fn delivered_event_is_stored() {
        let log = Logger::new("test");
        let db = Arc::new(MemoryDb::new());
        let queue = InMemoryQueue::new(&InMemoryConfig::default(), &log);
        EventHandler::new(db.clone(), &log).start(&queue).await.unwrap();

        let event = sample();
        queue.enqueue(&event).await.unwrap();
        settle(&queue, |stats| stats.acked == 1).await;
        queue.close().await.unwrap();

        assert_eq!(db.get(event.id()), Some(event));
    }

    #[tokio::test]
    async fn undecodable_payload_fails_the_message() {
        let log = Logger::new("test");
        let db = Arc::new(MemoryDb::new());
        let queue = InMemoryQueue::new(&InMemoryConfig::default(), &log);
        EventHandler::new(db.clone(), &log).start(&queue).await.unwrap();

        queue
            .publish(Envelope::new("event", b"not json".to_vec()))
            .await
            .unwrap();
        settle(&queue, |stats| stats.handler_failures >= 1).await;
        queue.close().await.unwrap();

        assert!(db.is_empty());
    }

    struct StuckDb;

    #[async_trait]
    impl EventDatabase for StuckDb {
        async fn insert(&self, _event: &Event) -> Result<(), DatabaseError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn close(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_invocation_abandons_insert() {
        let handler = EventHandler::new(Arc::new(StuckDb), &Logger::new("test"));
        let cancellation = CancellationToken::new();
        let invocation = Invocation::new(
            "event".into(),
            sample().to_json().unwrap(),
            cancellation.clone(),
            tokio::time::Instant::now() + Duration::from_secs(1),
        );

        let task = tokio::spawn(async move { handler.handle(invocation).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancellation.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().starts_with("worker.event.cancelled"), "{err}");
    }
}
