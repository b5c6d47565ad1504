//! Reader-loop engine shared by every backend.
//!
//! A backend supplies a [`DeliverySource`] per reader loop (fetch one message,
//! settle it once processed). The engine owns everything else: the
//! [`Dispatcher`] resolves the handler, runs it on its own task under the
//! per-message deadline and reports an [`Outcome`]; [`run_reader`] drives
//! fetch → dispatch → settle until shutdown; [`ReaderGroup`] spawns a fixed
//! number of loops and joins them on close.

use std::{
    fmt,
    future::Future,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use analyzer_models::errors::SendableError;
use analyzer_utilities::Logger;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::{HandlerRegistry, Invocation},
    Envelope, QueueError,
};

const FETCH_BACKOFF: Duration = Duration::from_secs(1);

/// Result of dispatching one envelope.
pub enum Outcome {
    Completed,
    Failed(SendableError),
    Panicked,
    TimedOut(Duration),
    UnknownType(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Short reason, used in logs and dead-letter headers.
    pub fn reason(&self) -> String {
        match self {
            Outcome::Completed => "completed".to_string(),
            Outcome::Failed(err) => format!("handler error: {err}"),
            Outcome::Panicked => "handler panicked".to_string(),
            Outcome::TimedOut(after) => format!("handler timed out after {after:?}"),
            Outcome::UnknownType(tag) => format!("unknown message type '{tag}'"),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// What a backend did with a delivery after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    handler_failures: AtomicU64,
    timeouts: AtomicU64,
    unknown_messages: AtomicU64,
    settle_failures: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
    pub timeouts: u64,
    pub unknown_messages: u64,
    pub settle_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }

    fn record_settlement(&self, settlement: Settlement) {
        let counter = match settlement {
            Settlement::Acked => &self.acked,
            Settlement::Requeued => &self.requeued,
            Settlement::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resolves handlers and runs them under the per-message deadline.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    handler_timeout: Duration,
    stats: Arc<ConsumerStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, handler_timeout: Duration) -> Self {
        Self {
            registry,
            handler_timeout,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub async fn dispatch(&self, envelope: Envelope, log: &Logger) -> Outcome {
        let Some(handler) = self.registry.resolve(&envelope.type_tag) else {
            self.stats.unknown_messages.fetch_add(1, Ordering::Relaxed);
            error!(
                target: log.target(),
                "unknown message: type_tag='{}' payload={}",
                envelope.type_tag,
                envelope.payload_preview()
            );
            return Outcome::UnknownType(envelope.type_tag);
        };

        let type_tag = envelope.type_tag.clone();
        let cancellation = CancellationToken::new();
        let deadline = Instant::now() + self.handler_timeout;
        let invocation = Invocation::new(
            envelope.type_tag,
            envelope.payload,
            cancellation.clone(),
            deadline,
        );

        // A late result lands in a dropped JoinHandle and is discarded.
        let task = tokio::spawn(handler.call(invocation));
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(Ok(()))) => {
                debug!(target: log.target(), "handled message type_tag='{}'", type_tag);
                Outcome::Completed
            }
            Ok(Ok(Err(err))) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: log.target(),
                    "handler failed: type_tag='{}' error={}", type_tag, err
                );
                Outcome::Failed(err)
            }
            Ok(Err(join_err)) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: log.target(),
                    "handler task crashed: type_tag='{}' error={}", type_tag, join_err
                );
                Outcome::Panicked
            }
            Err(_) => {
                cancellation.cancel();
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: log.target(),
                    "handler timed out after {:?}: type_tag='{}'", self.handler_timeout, type_tag
                );
                Outcome::TimedOut(self.handler_timeout)
            }
        }
    }
}

/// Per-reader view of a backend.
#[async_trait]
pub trait DeliverySource: Send + Sync + 'static {
    /// Backend handle needed to settle a fetched message.
    type Delivery: Send + 'static;

    /// Waits for the next message. `Ok(None)` means the source is exhausted
    /// (channel or broker closed) and the loop should exit.
    async fn fetch(&self) -> Result<Option<(Envelope, Self::Delivery)>, QueueError>;

    /// Acknowledges or rejects `delivery` according to `outcome`.
    async fn settle(
        &self,
        delivery: Self::Delivery,
        outcome: &Outcome,
    ) -> Result<Settlement, QueueError>;

    /// Releases per-reader resources once the loop is done.
    async fn finish(&self) {}
}

/// Fetch → dispatch → settle until `shutdown` fires or the source runs dry.
///
/// Shutdown is only observed between messages: a message that was fetched is
/// always dispatched and settled before the loop exits. A settle error that
/// [halts the reader](QueueError::halts_reader) cancels `shutdown`, which
/// stops every loop sharing it.
pub async fn run_reader<S>(
    source: S,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    log: Logger,
) where
    S: DeliverySource,
{
    debug!(target: log.target(), "start read loop");
    loop {
        let fetched = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            fetched = source.fetch() => fetched,
        };

        let (envelope, delivery) = match fetched {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(target: log.target(), "source closed, leaving read loop");
                break;
            }
            Err(err) => {
                error!(target: log.target(), "fetch message: {}", err);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_BACKOFF) => {}
                }
                continue;
            }
        };

        let outcome = dispatcher.dispatch(envelope, &log).await;
        match source.settle(delivery, &outcome).await {
            Ok(settlement) => dispatcher.stats.record_settlement(settlement),
            Err(err) if err.halts_reader() => {
                dispatcher.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
                error!(target: log.target(), "halting all read loops: {}", err);
                shutdown.cancel();
                break;
            }
            Err(err) => {
                dispatcher.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
                error!(target: log.target(), "settle message ({:?}): {}", outcome, err);
            }
        }
    }
    source.finish().await;
    debug!(target: log.target(), "finish read loop");
}

/// Opens `count` sources with `open(index)`. When one fails, the sources
/// opened so far are finished and the error is returned.
pub async fn open_sources<S, F, Fut>(count: usize, mut open: F) -> Result<Vec<S>, QueueError>
where
    S: DeliverySource,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<S, QueueError>>,
{
    let mut sources = Vec::with_capacity(count);
    for index in 0..count {
        match open(index).await {
            Ok(source) => sources.push(source),
            Err(err) => {
                for source in &sources {
                    source.finish().await;
                }
                return Err(err);
            }
        }
    }
    Ok(sources)
}

enum ReaderState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Closed,
}

/// Fixed set of reader tasks belonging to one queue instance.
pub struct ReaderGroup {
    shutdown: CancellationToken,
    state: Mutex<ReaderState>,
    log: Logger,
}

impl ReaderGroup {
    pub fn new(log: Logger) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            state: Mutex::new(ReaderState::Idle),
            log,
        }
    }

    /// Fails unless the group can still be started.
    pub fn ensure_idle(&self) -> Result<(), QueueError> {
        match *self.state.lock() {
            ReaderState::Idle => Ok(()),
            ReaderState::Running(_) => Err(QueueError::AlreadyStarted),
            ReaderState::Closed => Err(QueueError::Closed),
        }
    }

    /// Spawns one task per entry of `loops`, each handed the group's
    /// shutdown token.
    pub fn start<F, Fut>(&self, loops: Vec<F>) -> Result<(), QueueError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        match *state {
            ReaderState::Running(_) => return Err(QueueError::AlreadyStarted),
            ReaderState::Closed => return Err(QueueError::Closed),
            ReaderState::Idle => {}
        }
        let count = loops.len();
        if count == 0 {
            warn!(target: self.log.target(), "read loop count is 0, no readers started");
        }
        let handles = loops
            .into_iter()
            .map(|spawn_loop| tokio::spawn(spawn_loop(self.shutdown.clone())))
            .collect();
        *state = ReaderState::Running(handles);
        info!(target: self.log.target(), "started {} read loop(s)", count);
        Ok(())
    }

    /// Runs [`run_reader`] over each of `sources`.
    pub fn start_readers<S: DeliverySource>(
        &self,
        sources: Vec<S>,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<(), QueueError> {
        let loops = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                let dispatcher = Arc::clone(dispatcher);
                let log = self.log.named("read").named(index);
                move |shutdown: CancellationToken| run_reader(source, dispatcher, shutdown, log)
            })
            .collect::<Vec<_>>();
        self.start(loops)
    }

    /// Stops new fetches and waits for every loop to exit.
    ///
    /// Returns false when the group was already closed.
    pub async fn close(&self) -> bool {
        let handles = match mem::replace(&mut *self.state.lock(), ReaderState::Closed) {
            ReaderState::Closed => return false,
            ReaderState::Idle => Vec::new(),
            ReaderState::Running(handles) => handles,
        };
        self.shutdown.cancel();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(target: self.log.target(), "read loop ended abnormally: {}", err);
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ReaderState::Closed)
    }
}
