// Parley Core Library
// Session and conversation-context engine for AI agent runtimes

pub mod config;
pub mod context;
pub mod manager;
pub mod session;
pub mod storage;
pub mod telemetry;

// Export core types
pub use config::{CompactionKind, SessionConfig};
pub use context::{
    CompactionStrategy, ConversationContext, Message, MessageRole, TokenCount, Tokenizer,
};
pub use manager::{SessionManager, SessionState, SessionStats, SwitchReport, DEFAULT_SESSION_ID};
pub use session::{
    BroadcastEventSink, ConnectorFactory, ConnectorReply, EchoConnectorFactory, EventSink,
    ModelConfig, ModelConnector, ScopedEventSink, Session, SessionEvent, SessionMetadata,
    SessionSnapshot,
};
pub use storage::{DurableStore, FastStore, SessionStore};

use std::sync::Arc;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session limit reached ({max} sessions)")]
    Capacity { max: usize },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Session {0} is already running")]
    SessionBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Core runtime
///
/// Owns the session manager and the process-wide event stream, and drives the
/// background sweep for the lifetime of the process.
pub struct Parley {
    pub events: Arc<BroadcastEventSink>,
    pub sessions: Arc<SessionManager>,
}

impl Parley {
    pub fn new(
        config: SessionConfig,
        store: Arc<SessionStore>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Result<Self> {
        let events = Arc::new(BroadcastEventSink::default());
        let sessions = Arc::new(SessionManager::new(
            config,
            store,
            connectors,
            Some(events.clone() as Arc<dyn EventSink>),
        )?);

        Ok(Self { events, sessions })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting Parley...");

        let expired = self.sessions.initialize().await;
        self.sessions.start_sweeper();

        tracing::info!(expired, "Parley started successfully");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down Parley...");

        self.sessions.shutdown().await;

        tracing::info!("Parley shut down successfully");
        Ok(())
    }
}
