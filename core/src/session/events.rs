// Event streaming for sessions
//
// Each session owns an isolated broadcast channel. A ScopedEventSink wraps the
// process-wide sink and relabels events with the session id, so one listener can
// follow a single session or all of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const MESSAGE_ADDED: &str = "message_added";
pub const HISTORY_RESET: &str = "history_reset";
pub const HISTORY_COMPACTED: &str = "compacted";
pub const RUN_STARTED: &str = "run_started";
pub const RUN_COMPLETED: &str = "run_completed";
pub const RUN_FAILED: &str = "run_failed";
pub const MODEL_SWITCHED: &str = "model_switched";

/// Event emitted by a session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Event name (session-scoped names look like `<session_id>:<name>`)
    pub name: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Destination for session events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Event broadcaster backed by a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventSink {
    /// Create a new broadcaster with buffer size
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SessionEvent) {
        // Ignore error if no subscribers
        let _ = self.sender.send(event);
    }
}

/// Forwards events to another sink under a session-scoped name
pub struct ScopedEventSink {
    scope: String,
    inner: Arc<dyn EventSink>,
}

impl ScopedEventSink {
    pub fn new(scope: impl Into<String>, inner: Arc<dyn EventSink>) -> Self {
        Self {
            scope: scope.into(),
            inner,
        }
    }
}

impl EventSink for ScopedEventSink {
    fn emit(&self, mut event: SessionEvent) {
        event.name = format!("{}:{}", self.scope, event.name);
        self.inner.emit(event);
    }
}
