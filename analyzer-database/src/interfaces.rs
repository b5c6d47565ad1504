use analyzer_models::Event;
use async_trait::async_trait;

use crate::DatabaseError;

/// Storage collaborator for the worker.
///
/// Implementations must not hold borrowed state; they are shared as
/// `Arc<dyn EventDatabase>` across handler tasks.
#[async_trait]
pub trait EventDatabase: Send + Sync + 'static {
    /// Stores `event`. Storing the same id again is a no-op, so redelivered
    /// messages never duplicate rows.
    async fn insert(&self, event: &Event) -> Result<(), DatabaseError>;

    async fn close(&self) -> Result<(), DatabaseError>;
}
