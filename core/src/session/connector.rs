//! Model connector port.
//!
//! A session holds one bound connector and forwards completion requests to it.
//! How the connector talks to a model is outside this crate; the session manager
//! only decides when a connector is (re)bound, after validating the requested
//! configuration against the session's current state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{tokenizer_for_model, ContextUsage, Message, TokenCount, Tokenizer, ToolCall};
use crate::{ParleyError, Result};

/// Which model a session talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Context window advertised through the `max_context_tokens` parameter
    pub fn max_context_tokens(&self) -> Option<usize> {
        self.parameters
            .get("max_context_tokens")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: std::env::var("PARLEY_PROVIDER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "echo".to_string()),
            model: std::env::var("PARLEY_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "echo-1".to_string()),
            parameters: HashMap::new(),
        }
    }
}

/// Assistant turn returned by a connector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ConnectorReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Session runtime state offered to connector validation
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub model: ModelConfig,
    pub usage: ContextUsage,
}

/// A bound connection to a language model
#[async_trait]
pub trait ModelConnector: Send + Sync {
    fn model(&self) -> &ModelConfig;

    /// Produce the next assistant turn for the given (already budgeted) history
    async fn complete(&self, messages: &[Message]) -> Result<ConnectorReply>;

    /// Release any resources held by the connector
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates connectors and decides whether a configuration suits a session
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Check a requested configuration against one session's current state
    fn validate(&self, config: &ModelConfig, session: &SessionSnapshot) -> Result<()>;

    async fn connect(&self, config: &ModelConfig) -> Result<Arc<dyn ModelConnector>>;

    /// Tokenizer for the model family, if budget enforcement should apply
    fn tokenizer(&self, _config: &ModelConfig) -> Option<Arc<dyn Tokenizer>> {
        None
    }
}

/// Connector that answers by echoing the latest user message
pub struct EchoConnector {
    config: ModelConfig,
}

#[async_trait]
impl ModelConnector for EchoConnector {
    fn model(&self) -> &ModelConfig {
        &self.config
    }

    async fn complete(&self, messages: &[Message]) -> Result<ConnectorReply> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::context::MessageRole::User)
            .and_then(Message::text)
            .unwrap_or_default();
        Ok(ConnectorReply::text(format!("echo: {last_user}")))
    }
}

/// Factory for `EchoConnector`, useful in development and tests
#[derive(Debug, Default)]
pub struct EchoConnectorFactory;

#[async_trait]
impl ConnectorFactory for EchoConnectorFactory {
    fn validate(&self, config: &ModelConfig, session: &SessionSnapshot) -> Result<()> {
        if config.model.is_empty() {
            return Err(ParleyError::Connector("model name is required".to_string()));
        }
        if let (Some(window), TokenCount::Known(used)) =
            (config.max_context_tokens(), session.usage.tokens)
        {
            if used > window {
                return Err(ParleyError::Connector(format!(
                    "session {} holds {} tokens, more than {} fits in {}",
                    session.session_id, used, window, config.model
                )));
            }
        }
        Ok(())
    }

    async fn connect(&self, config: &ModelConfig) -> Result<Arc<dyn ModelConnector>> {
        Ok(Arc::new(EchoConnector {
            config: config.clone(),
        }))
    }

    fn tokenizer(&self, config: &ModelConfig) -> Option<Arc<dyn Tokenizer>> {
        Some(tokenizer_for_model(&config.model))
    }
}
