pub mod adapters;
pub mod config;
pub mod consumer;
mod errors;
pub mod in_memory;
pub mod offsets;
pub mod registry;
mod types;

pub use analyzer_models::Message;
pub use config::QueueConfig;
pub use consumer::{Outcome, StatsSnapshot};
pub use errors::QueueError;
pub use registry::{handler_fn, Handler, HandlerResult, Invocation};
pub use tokio_util::sync::CancellationToken;
pub use types::Envelope;

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Producer/consumer surface shared by every queue backend.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Registers `handler` for messages tagged `type_tag`; the last
    /// registration for a tag wins. Register before [`Queue::read_start`].
    fn handle(&self, type_tag: &str, handler: Arc<dyn Handler>);

    /// Publishes an already-encoded envelope. No retry is attempted.
    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Opens the per-reader broker resources and spawns the configured
    /// number of reader loops. Fails without spawning anything when a
    /// reader cannot be opened.
    async fn read_start(&self) -> Result<(), QueueError>;

    /// Stops fetching, waits for the reader loops to finish their current
    /// message and releases broker connections. Later calls are no-ops.
    async fn close(&self) -> Result<(), QueueError>;

    fn stats(&self) -> StatsSnapshot;
}

/// Typed helpers over [`Queue`], keyed by [`Message::TYPE_TAG`].
pub trait QueueExt: Queue {
    fn handle_message<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle(M::TYPE_TAG, handler_fn(handler));
    }

    /// Serializes `message` and publishes it under its type tag.
    fn enqueue<'a, M: Message>(&'a self, message: &M) -> BoxFuture<'a, Result<(), QueueError>> {
        let envelope = Envelope::encode(message);
        Box::pin(async move { self.publish(envelope?).await })
    }
}

impl<Q: Queue + ?Sized> QueueExt for Q {}
