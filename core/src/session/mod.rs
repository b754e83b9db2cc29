// Sessions: a conversation context bound to a model connector, with its own
// event stream and a persisted metadata record

pub mod connector;
pub mod events;
pub mod handle;
pub mod metadata;

pub use connector::{
    ConnectorFactory, ConnectorReply, EchoConnector, EchoConnectorFactory, ModelConfig,
    ModelConnector, SessionSnapshot,
};
pub use events::{BroadcastEventSink, EventSink, ScopedEventSink, SessionEvent};
pub use handle::Session;
pub use metadata::SessionMetadata;
