//! Event bus - pub/sub stream of run lifecycle events
//!
//! Built on tokio broadcast channels: the runtime emits, any number of
//! reporters subscribe. Emission is fire-and-forget; a run never blocks
//! on a slow reporter, and "subscribe to everything" is just another
//! subscription.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::collection::model::CollectionInfo;

use super::types::{ConsoleLevel, Envelope, IterationInfo, PathType, RunEvent};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for a run
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers. No subscribers is fine; if the
    /// channel is full the oldest events are dropped.
    pub fn emit(&self, event: RunEvent) {
        debug!(event_type = event.event_type(), path = %event.envelope().path, "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Create an emitter bound to a collection (and optionally an iteration)
    pub fn emitter_for(&self, collection: CollectionInfo) -> RunEmitter {
        RunEmitter {
            tx: self.tx.clone(),
            collection,
            iteration: None,
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for components to emit events without owning the bus.
/// Cheap to clone; carries the envelope boilerplate.
#[derive(Clone)]
pub struct RunEmitter {
    tx: broadcast::Sender<RunEvent>,
    collection: CollectionInfo,
    iteration: Option<IterationInfo>,
}

impl RunEmitter {
    /// A copy of this emitter bound to an iteration
    pub fn for_iteration(&self, current: u32, total: u32) -> Self {
        Self {
            tx: self.tx.clone(),
            collection: self.collection.clone(),
            iteration: Some(IterationInfo { current, total }),
        }
    }

    /// Build an envelope for a path
    pub fn envelope(&self, path_type: PathType, path: impl Into<String>) -> Envelope {
        Envelope {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            path_type,
            collection: self.collection.clone(),
            iteration: self.iteration,
        }
    }

    /// Envelope for the collection itself
    pub fn collection_envelope(&self) -> Envelope {
        self.envelope(PathType::Collection, crate::collection::path::collection())
    }

    /// Emit a raw event
    pub fn emit(&self, event: RunEvent) {
        debug!(event_type = event.event_type(), "RunEmitter::emit");
        let _ = self.tx.send(event);
    }

    /// Emit a console-capture event
    pub fn console(&self, path_type: PathType, path: &str, level: ConsoleLevel, message: impl Into<String>) {
        self.emit(RunEvent::Console {
            envelope: self.envelope(path_type, path),
            level,
            message: message.into(),
        });
    }

    pub fn collection_info(&self) -> &CollectionInfo {
        &self.collection
    }

    pub fn iteration(&self) -> Option<IterationInfo> {
        self.iteration
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
