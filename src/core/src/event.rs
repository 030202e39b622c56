use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Streaming session event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxEvent {
    /// Event key (e.g., "session.attached", "server.idle")
    pub key: EventKey,

    /// Free-form attributes (container ID, stream, error text)
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MuxEvent {
    /// Create an event with no attributes
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attributes: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add an attribute
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<MuxEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped when nobody is subscribed
    pub fn emit(&self, event: MuxEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Session events
    pub const SESSION_ATTACHED: &str = "session.attached";
    pub const SESSION_DETACHED: &str = "session.detached";
    pub const SESSION_ENDED: &str = "session.ended";
    pub const SESSION_FAILED: &str = "session.failed";

    // Server events
    pub const SERVER_IDLE: &str = "server.idle";
}
