//! Role-specific shape checks for messages entering a conversation log.

use tracing::warn;

use super::types::{Message, MessageContent, MessageRole};
use crate::{ParleyError, Result};

/// Validate a candidate message against its role's shape.
///
/// System messages are accepted but logged as a warning: the system prompt
/// belongs in the context's dedicated slot.
pub fn validate_message(message: &Message) -> Result<()> {
    match message.role {
        MessageRole::User => match &message.content {
            Some(content) if !content.is_empty() => Ok(()),
            _ => Err(invalid("user message requires non-empty text or content parts")),
        },
        MessageRole::Assistant => {
            if let Some(calls) = &message.tool_calls {
                for call in calls {
                    if call.id.is_empty() || call.name.is_empty() || call.arguments.is_empty() {
                        return Err(invalid("tool call requires id, name and arguments"));
                    }
                }
            }
            if message.content.is_none() && !message.has_tool_calls() {
                return Err(invalid("assistant message requires content or tool calls"));
            }
            Ok(())
        }
        MessageRole::Tool => {
            let has_call_id = message.tool_call_id.as_deref().is_some_and(|id| !id.is_empty());
            let has_name = message.tool_name.as_deref().is_some_and(|name| !name.is_empty());
            if !has_call_id || !has_name {
                return Err(invalid("tool message requires tool_call_id and tool_name"));
            }
            if message.content.is_none() {
                return Err(invalid("tool message requires content"));
            }
            Ok(())
        }
        MessageRole::System => match &message.content {
            Some(MessageContent::Text(text)) if !text.is_empty() => {
                warn!("System message appended to history; prefer the system prompt slot");
                Ok(())
            }
            _ => Err(invalid("system message requires non-empty text")),
        },
    }
}

fn invalid(reason: &str) -> ParleyError {
    ParleyError::Validation(reason.to_string())
}
