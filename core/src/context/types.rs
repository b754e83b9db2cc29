//! Core types for the conversation log.
//!
//! This module defines the records stored in a conversation:
//! - Message: one immutable entry in the log
//! - MessageContent: plain text or an ordered list of typed parts
//! - ToolCall: a tool invocation requested by the assistant

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ParleyError, Result};

/// Roles for messages in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(ParleyError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// One typed part of a multimodal user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    Attachment { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image { url: url.into() }
    }
}

/// Message body: either plain text or an ordered list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Parts(_) => None,
        }
    }

    /// Text fragments in order; non-text parts contribute nothing.
    pub fn text_fragments(&self) -> Vec<&str> {
        match self {
            Self::Text(text) => vec![text.as_str()],
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A tool invocation requested by an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Serialized argument payload
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// An entry in a conversation log.
///
/// Messages are validated against their role's shape before they are appended
/// and are never mutated afterwards. The timestamp is informational only; log
/// order is the ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,

    pub content: Option<MessageContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<MessageContent>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(MessageContent::Text(text.into())))
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::with_role(MessageRole::User, Some(MessageContent::Parts(parts)))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(MessageContent::Text(text.into())))
    }

    /// Assistant turn carrying tool calls, with optional accompanying text
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message =
            Self::with_role(MessageRole::Assistant, content.map(MessageContent::Text));
        message.tool_calls = Some(tool_calls);
        message
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut message =
            Self::with_role(MessageRole::Tool, Some(MessageContent::Text(content.into())));
        message.tool_call_id = Some(tool_call_id.into());
        message.tool_name = Some(tool_name.into());
        message
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(MessageContent::Text(text.into())))
    }

    /// Parse an untyped record (e.g. from a front end).
    ///
    /// Unknown roles and malformed records are validation errors.
    pub fn from_json(value: Value) -> Result<Self> {
        let role = value
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| ParleyError::Validation("message has no role".to_string()))?;
        role.parse::<MessageRole>()?;

        serde_json::from_value(value).map_err(|e| ParleyError::Validation(e.to_string()))
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(MessageContent::as_text)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_role_rejected() {
        let err = Message::from_json(serde_json::json!({
            "role": "narrator",
            "content": "Once upon a time",
        }))
        .unwrap_err();

        assert!(matches!(err, ParleyError::Validation(_)));
    }

    #[test]
    fn test_from_json_tool_message() {
        let message = Message::from_json(serde_json::json!({
            "role": "tool",
            "content": "42",
            "tool_call_id": "call_1",
            "tool_name": "calculator",
        }))
        .unwrap();

        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(message.text(), Some("42"));
    }

    #[test]
    fn test_multimodal_content_parses_parts() {
        let message = Message::from_json(serde_json::json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "What is this?" },
                { "type": "image", "url": "https://example.com/cat.png" },
            ],
        }))
        .unwrap();

        let content = message.content.unwrap();
        assert_eq!(content.text_fragments(), vec!["What is this?"]);
    }

    #[test]
    fn test_assistant_with_only_tool_calls_has_null_content() {
        let message = Message::assistant_tool_calls(
            None,
            vec![ToolCall::new("call_1", "search", r#"{"q":"rust"}"#)],
        );

        assert!(message.content.is_none());
        assert!(message.has_tool_calls());
    }
}
