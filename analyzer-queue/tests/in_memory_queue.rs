use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use analyzer_models::{errors::RuntimeError, Event, EventType};
use analyzer_queue::{
    in_memory::{InMemoryBroker, InMemoryConfig, InMemoryQueue},
    Envelope, Invocation, Queue, QueueError, QueueExt,
};
use analyzer_utilities::Logger;
use serde_json::value::RawValue;
use tokio::sync::mpsc;

fn queue(read_loop: usize, handler_timeout_sec: u64) -> InMemoryQueue {
    InMemoryQueue::new(
        &InMemoryConfig {
            handler_timeout_sec,
            read_loop,
        },
        &Logger::new("test"),
    )
}

fn event(identifier: &str) -> Event {
    Event::new(
        EventType::USER,
        identifier,
        Some("user-1".into()),
        RawValue::from_string(r#"{"page":"/home"}"#.to_string()).unwrap(),
    )
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn enqueued_event_reaches_handler_intact() {
    let queue = queue(1, 5);
    let (tx, mut rx) = mpsc::unbounded_channel();
    queue.handle_message::<Event, _, _>(move |invocation: Invocation| {
        let tx = tx.clone();
        async move {
            let decoded: Event = match invocation.decode() {
                Ok(event) => event,
                Err(err) => return Err(RuntimeError::boxed("test.decode", err)),
            };
            let _ = tx.send(decoded);
            Ok(())
        }
    });
    queue.read_start().await.unwrap();

    let sent = event("page-view");
    queue.enqueue(&sent).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, sent);
    assert_eq!(received.data().get(), r#"{"page":"/home"}"#);

    queue.close().await.unwrap();
    assert_eq!(queue.stats().acked, 1);
}

#[tokio::test]
async fn unknown_type_does_not_stop_the_reader() {
    let queue = queue(1, 5);
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    queue.handle_message::<Event, _, _>(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    queue.read_start().await.unwrap();

    queue
        .publish(Envelope::new("no-such-type", b"{}".to_vec()))
        .await
        .unwrap();
    queue.enqueue(&event("after-unknown")).await.unwrap();

    wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    queue.close().await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.unknown_messages, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 1);
    let dead = queue.broker().dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.type_tag, "no-such-type");
}

#[tokio::test]
async fn failed_handler_is_retried() {
    let queue = queue(1, 5);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    queue.handle(
        "job",
        analyzer_queue::handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(RuntimeError::boxed("test.job", "first attempt fails"));
                }
                Ok(())
            }
        }),
    );
    queue.read_start().await.unwrap();
    queue.publish(Envelope::new("job", Vec::new())).await.unwrap();

    wait_until(|| queue.stats().acked == 1).await;
    queue.close().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stats = queue.stats();
    assert_eq!(stats.handler_failures, 1);
    assert_eq!(stats.requeued, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_handler_is_redelivered_fast_ones_are_acked_once() {
    let queue = queue(2, 1);
    let calls: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let seen = Arc::clone(&calls);
    queue.handle(
        "job",
        analyzer_queue::handler_fn(move |invocation| {
            let seen = Arc::clone(&seen);
            async move {
                let name = String::from_utf8_lossy(invocation.payload()).into_owned();
                let attempt = {
                    let mut calls = seen.lock().unwrap();
                    let count = calls.entry(name.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let work = if name == "slow" && attempt == 1 {
                    Duration::from_secs(2)
                } else {
                    Duration::from_millis(100)
                };
                tokio::time::sleep(work).await;
                Ok(())
            }
        }),
    );
    queue.read_start().await.unwrap();

    for name in ["slow", "fast-1", "fast-2", "fast-3"] {
        queue
            .publish(Envelope::new("job", name.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    wait_until(|| queue.stats().acked == 4).await;
    queue.close().await.unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls["slow"], 2);
    for name in ["fast-1", "fast-2", "fast-3"] {
        assert_eq!(calls[name], 1, "{name} handled more than once");
    }
    let stats = queue.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.requeued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_message_is_dispatched_to_one_reader_at_a_time() {
    const MESSAGES: usize = 200;
    let queue = queue(8, 5);
    let active: Arc<Mutex<HashMap<Vec<u8>, usize>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let (active_ref, overlaps_ref, handled_ref) =
        (Arc::clone(&active), Arc::clone(&overlaps), Arc::clone(&handled));
    queue.handle(
        "job",
        analyzer_queue::handler_fn(move |invocation| {
            let active = Arc::clone(&active_ref);
            let overlaps = Arc::clone(&overlaps_ref);
            let handled = Arc::clone(&handled_ref);
            async move {
                let key = invocation.payload().to_vec();
                {
                    let mut active = active.lock().unwrap();
                    let count = active.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::task::yield_now().await;
                *active.lock().unwrap().get_mut(&key).unwrap() -= 1;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    queue.read_start().await.unwrap();

    for index in 0..MESSAGES {
        queue
            .publish(Envelope::new("job", index.to_string().into_bytes()))
            .await
            .unwrap();
    }

    wait_until(|| handled.load(Ordering::SeqCst) == MESSAGES).await;
    queue.close().await.unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(handled.load(Ordering::SeqCst), MESSAGES);
    assert_eq!(active.lock().unwrap().len(), MESSAGES);
    assert_eq!(queue.stats().acked, MESSAGES as u64);
}

#[tokio::test]
async fn close_waits_for_in_flight_message() {
    let queue = queue(1, 5);
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_ref, finished_ref) = (Arc::clone(&started), Arc::clone(&finished));
    queue.handle(
        "job",
        analyzer_queue::handler_fn(move |_| {
            let started = Arc::clone(&started_ref);
            let finished = Arc::clone(&finished_ref);
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    queue.read_start().await.unwrap();
    queue.publish(Envelope::new("job", Vec::new())).await.unwrap();

    wait_until(|| started.load(Ordering::SeqCst)).await;
    queue.close().await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(queue.stats().acked, 1);
    assert_eq!(queue.broker().in_flight(), 0);
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let queue = queue(2, 5);
    queue.read_start().await.unwrap();
    assert!(matches!(queue.read_start().await, Err(QueueError::AlreadyStarted)));

    queue.close().await.unwrap();
    queue.close().await.unwrap();

    assert!(matches!(queue.read_start().await, Err(QueueError::Closed)));
    assert!(queue.publish(Envelope::new("job", Vec::new())).await.is_err());
}

#[tokio::test]
async fn close_without_start_releases_broker() {
    let queue = queue(1, 5);
    queue.close().await.unwrap();
    assert!(queue.enqueue(&event("late")).await.is_err());
}

#[tokio::test]
async fn producer_close_leaves_shared_consumer_running() {
    let log = Logger::new("test");
    let broker = InMemoryBroker::new();
    let config = InMemoryConfig::default();
    let producer = InMemoryQueue::with_broker(broker.clone(), &config, &log);
    let consumer = InMemoryQueue::with_broker(broker.clone(), &config, &log);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    consumer.handle(
        "job",
        analyzer_queue::handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    consumer.read_start().await.unwrap();

    producer.publish(Envelope::new("job", Vec::new())).await.unwrap();
    wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    producer.close().await.unwrap();

    consumer.publish(Envelope::new("job", Vec::new())).await.unwrap();
    wait_until(|| handled.load(Ordering::SeqCst) == 2).await;

    consumer.close().await.unwrap();
    assert!(broker.publish(Envelope::new("job", Vec::new())).is_err());
    assert_eq!(consumer.stats().acked, 2);
}
