//! Fan-out of detected events to connected listeners.
//!
//! The notifier only knows the [`EventListener`] trait; transports (SSE,
//! websockets, test collectors) plug in by implementing it. Delivery never
//! blocks: a listener whose buffer is full misses that event, and a listener
//! whose receiving side is gone is dropped from the registry by the publish
//! that notices it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::DetectedEvent;

/// Default per-listener buffer size
pub const DEFAULT_LISTENER_BUFFER: usize = 64;

/// Identifier handed out by [`EventNotifier::subscribe`]
pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("listener buffer is full")]
    Full,
    #[error("listener disconnected")]
    Disconnected,
}

/// Push-style sink for detected events.
pub trait EventListener: Send + Sync {
    /// Hand `event` over without blocking.
    fn deliver(&self, event: &DetectedEvent) -> Result<(), DeliveryError>;
}

/// Listener backed by a bounded tokio channel
pub struct ChannelListener {
    tx: mpsc::Sender<DetectedEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiver its events arrive on
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DetectedEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn deliver(&self, event: &DetectedEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}

/// Registry of listeners receiving every published event
pub struct EventNotifier {
    listeners: RwLock<HashMap<ListenerId, Arc<dyn EventListener>>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for all future events
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, listener);
        debug!(listener_id = id, "Listener subscribed");
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.listeners.write().remove(&id).is_some();
        if removed {
            debug!(listener_id = id, "Listener unsubscribed");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every registered listener.
    ///
    /// Returns the number of listeners that accepted it.
    pub fn publish(&self, event: &DetectedEvent) -> usize {
        let snapshot: Vec<(ListenerId, Arc<dyn EventListener>)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for (id, listener) in snapshot {
            match listener.deliver(event) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(
                        listener_id = id,
                        event_id = %event.id,
                        "Listener lagging, event skipped"
                    );
                }
                Err(DeliveryError::Disconnected) => disconnected.push(id),
            }
        }

        if !disconnected.is_empty() {
            let mut listeners = self.listeners.write();
            for id in &disconnected {
                listeners.remove(id);
            }
            debug!(removed = disconnected.len(), "Dropped disconnected listeners");
        }

        debug!(
            event_id = %event.id,
            token = ?event.token,
            delivered,
            "Published event"
        );
        delivered
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
