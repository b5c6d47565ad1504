use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use analyzer_models::Event;
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{DatabaseError, EventDatabase};

/// Process-local store keyed by event id.
#[derive(Default)]
pub struct MemoryDb {
    events: RwLock<HashMap<Uuid, Event>>,
    closed: AtomicBool,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Event> {
        self.events.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventDatabase for MemoryDb {
    async fn insert(&self, event: &Event) -> Result<(), DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        self.events
            .write()
            .entry(event.id())
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
