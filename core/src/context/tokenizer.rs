//! Token Counting
//!
//! Provides token counting for conversation budgets. Tokenizers are pluggable per
//! model family and may fail; a context without one simply skips budget enforcement.

use std::sync::Arc;

use super::types::Message;
use crate::Result;

/// Fixed per-message cost added on top of content tokens (role markers, separators)
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token counting interface for different LLM model families
pub trait Tokenizer: Send + Sync {
    /// Count tokens in text
    fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Result of a token count: a number, or an admission that counting was not possible.
///
/// `Unknown` is returned when no tokenizer is bound or when the tokenizer failed on
/// any message; a partial sum is never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCount {
    Known(usize),
    Unknown,
}

impl TokenCount {
    pub fn known(self) -> Option<usize> {
        match self {
            Self::Known(n) => Some(n),
            Self::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Character-based token estimator.
///
/// Uses simple character-based estimation:
/// - Average 4 characters per token (common for English)
/// - 3.5 characters per token for other model families
pub struct CharEstimateTokenizer {
    model: String,
}

impl CharEstimateTokenizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn gpt4() -> Self {
        Self::new("gpt-4")
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chars_per_token(&self) -> f32 {
        if self.model.contains("gpt-4") || self.model.contains("claude") {
            4.0
        } else {
            3.5
        }
    }
}

impl Tokenizer for CharEstimateTokenizer {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        // Add 10% buffer for special tokens
        let base_estimate = (text.chars().count() as f32 / self.chars_per_token()).ceil() as usize;
        Ok(base_estimate + (base_estimate / 10))
    }
}

/// Create a shared tokenizer for a model
pub fn tokenizer_for_model(model: &str) -> Arc<dyn Tokenizer> {
    Arc::new(CharEstimateTokenizer::new(model))
}

/// Applies the accounting rules for a conversation.
///
/// A message costs its text content (text parts only for multimodal content), the
/// name and arguments of each tool call, plus `MESSAGE_OVERHEAD_TOKENS`. The system
/// prompt is counted once on top.
pub struct TokenMeter<'a> {
    tokenizer: &'a dyn Tokenizer,
    system_prompt: Option<&'a str>,
}

impl<'a> TokenMeter<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer, system_prompt: Option<&'a str>) -> Self {
        Self {
            tokenizer,
            system_prompt,
        }
    }

    /// Tokens charged regardless of the log (the system prompt)
    pub fn base_tokens(&self) -> Result<usize> {
        match self.system_prompt {
            Some(prompt) => self.tokenizer.count_tokens(prompt),
            None => Ok(0),
        }
    }

    pub fn message_tokens(&self, message: &Message) -> Result<usize> {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS;

        if let Some(content) = &message.content {
            for fragment in content.text_fragments() {
                tokens += self.tokenizer.count_tokens(fragment)?;
            }
        }

        if let Some(calls) = &message.tool_calls {
            for call in calls {
                tokens += self.tokenizer.count_tokens(&call.name)?;
                tokens += self.tokenizer.count_tokens(&call.arguments)?;
            }
        }

        Ok(tokens)
    }

    pub fn total(&self, messages: &[Message]) -> Result<usize> {
        let mut total = self.base_tokens()?;
        for message in messages {
            total += self.message_tokens(message)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{ContentPart, ToolCall};

    struct LenTokenizer;

    impl Tokenizer for LenTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.len())
        }
    }

    #[test]
    fn test_text_counting() {
        let tokenizer = CharEstimateTokenizer::gpt4();

        let tokens = tokenizer.count_tokens("Hello, world!").unwrap();
        assert!(tokens > 0);
        assert!(tokens < 10);

        let long_text = "The quick brown fox jumps over the lazy dog. ".repeat(10);
        let long_tokens = tokenizer.count_tokens(&long_text).unwrap();
        assert!(long_tokens > tokens * 5);
    }

    #[test]
    fn test_meter_counts_tool_calls_and_overhead() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let message = Message::assistant_tool_calls(
            Some("ok".to_string()),
            vec![ToolCall::new("call_1", "search", "{}")],
        );

        // "ok" + "search" + "{}" + overhead
        assert_eq!(
            meter.message_tokens(&message).unwrap(),
            2 + 6 + 2 + MESSAGE_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn test_meter_skips_non_text_parts() {
        let meter = TokenMeter::new(&LenTokenizer, Some("sys"));
        let message = Message::user_parts(vec![
            ContentPart::text("abc"),
            ContentPart::image("https://example.com/very-long-image-url.png"),
        ]);

        assert_eq!(
            meter.total(&[message]).unwrap(),
            3 + 3 + MESSAGE_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn test_tokenizer_for_model() {
        let gpt4 = tokenizer_for_model("gpt-4-turbo");
        let other = tokenizer_for_model("llama-3");

        assert!(gpt4.count_tokens("Test message").unwrap() > 0);
        assert!(other.count_tokens("Test message").unwrap() > 0);
    }
}
