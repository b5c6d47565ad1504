use std::{collections::HashMap, future::Future, sync::Arc};

use analyzer_models::errors::SendableError;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type HandlerResult = Result<(), SendableError>;

/// One delivery handed to a handler.
///
/// The handler runs on its own task and is raced against `deadline`. When the
/// deadline passes first the message is settled as failed and the token
/// returned by [`Invocation::cancellation`] is cancelled; the task itself is
/// not aborted. Handlers doing long work should `select!` on
/// `cancellation().cancelled()` and return early, and must not assume their
/// side effects were acknowledged once cancelled.
#[derive(Debug)]
pub struct Invocation {
    type_tag: String,
    payload: Vec<u8>,
    cancellation: CancellationToken,
    deadline: Instant,
}

impl Invocation {
    pub fn new(
        type_tag: String,
        payload: Vec<u8>,
        cancellation: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            type_tag,
            payload,
            cancellation,
            deadline,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserializes the JSON payload.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Processing function registered for one type tag.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(invocation))
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Type tag → handler table shared by every reader loop of a queue.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under `type_tag`, returning true when it replaced one.
    pub fn register(&self, type_tag: &str, handler: Arc<dyn Handler>) -> bool {
        self.handlers
            .write()
            .insert(type_tag.to_string(), handler)
            .is_some()
    }

    pub fn resolve(&self, type_tag: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(type_tag).cloned()
    }

    pub fn type_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.read().keys().cloned().collect();
        tags.sort();
        tags
    }
}
