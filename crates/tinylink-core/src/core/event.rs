//! Event system for controller communication
//!
//! Provides:
//! - Event types for wire traffic, status updates and lifecycle changes
//! - Event dispatcher for publishing events to subscribers

use tokio::sync::broadcast;

/// Controller event types
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Machine state changed; carries the names of the fields that changed
    StatusUpdate(Vec<String>),
    /// A line was written to the wire
    Sent(String),
    /// A line was received from the wire
    Received(String),
    /// An error occurred
    Error(String),
    /// Controller finished initialization and accepts work
    Ready,
    /// All outstanding operations were cancelled
    CancelRunningOps(String),
    /// Serial link closed
    Disconnected,
}

impl std::fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerEvent::StatusUpdate(fields) => write!(f, "Status: {}", fields.join(",")),
            ControllerEvent::Sent(line) => write!(f, "> {}", line),
            ControllerEvent::Received(line) => write!(f, "< {}", line),
            ControllerEvent::Error(msg) => write!(f, "Error: {}", msg),
            ControllerEvent::Ready => write!(f, "Ready"),
            ControllerEvent::CancelRunningOps(reason) => write!(f, "Cancelled: {}", reason),
            ControllerEvent::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for controller events.
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Having no subscribers is not an error for the publisher.
    pub fn publish(&self, event: ControllerEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
