//! Named, synchronous publish/subscribe channel.
//!
//! Listeners run on the emitting task, in subscription order. The bus is
//! used by the shutdown protocol and is available for any other named event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::shutdown::ShutdownAck;

/// Payload delivered to a listener.
#[derive(Debug)]
pub enum EventPayload {
    /// Arbitrary event data.
    Data(Value),
    /// Shutdown notification carrying this listener's private acknowledgment.
    Shutdown(ShutdownAck),
}

impl EventPayload {
    /// Event data, if this is a data event.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Data(value) => Some(value),
            Self::Shutdown(_) => None,
        }
    }

    /// Take the shutdown acknowledgment, if this is a shutdown event.
    pub fn into_ack(self) -> Option<ShutdownAck> {
        match self {
            Self::Shutdown(ack) => Some(ack),
            Self::Data(_) => None,
        }
    }
}

/// Event listener callback.
pub type Listener = Arc<dyn Fn(EventPayload) + Send + Sync>;

/// Event bus keyed by event name.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .finish()
    }
}

impl EventBus {
    /// Create an empty event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `event`. Every subscription is invoked on emit.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Number of listeners currently subscribed to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Snapshot of the listeners subscribed to `event`.
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        self.listeners.read().get(event).cloned().unwrap_or_default()
    }

    /// Publish `data` to every listener of `event`. Returns how many were called.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.emit_with(event, || EventPayload::Data(data.clone()))
    }

    /// Publish a freshly built payload to each listener of `event`.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe
    /// from inside a callback without deadlocking; those late subscribers
    /// are not called for this emission.
    pub fn emit_with<F>(&self, event: &str, mut payload: F) -> usize
    where
        F: FnMut() -> EventPayload,
    {
        let listeners = self.listeners(event);
        trace!(event, listeners = listeners.len(), "Emitting event");
        for listener in &listeners {
            listener(payload());
        }
        listeners.len()
    }
}
