//! ConversationContext - the message log and token budget for one session
//!
//! Provides a simple API to append validated messages and to fetch a view of the
//! conversation that respects the configured token budget.

use std::sync::Arc;

use tracing::{debug, warn};

use super::compaction::{CompactionPipeline, CompactionReport, CompactionStrategy};
use super::tokenizer::{TokenCount, TokenMeter, Tokenizer};
use super::types::{ContentPart, Message, ToolCall};
use super::validation::validate_message;
use crate::config::SessionConfig;
use crate::Result;

/// Token usage snapshot for a conversation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub tokens: TokenCount,
    pub max_tokens: Option<usize>,
    pub messages: usize,
}

impl ContextUsage {
    /// Fraction of the budget in use, when both sides are known
    pub fn utilization(&self) -> Option<f32> {
        match (self.tokens, self.max_tokens) {
            (TokenCount::Known(used), Some(max)) if max > 0 => Some(used as f32 / max as f32),
            _ => None,
        }
    }
}

/// Message log, system prompt and compaction machinery for one conversation.
///
/// Owned by exactly one session. Budget enforcement needs both `max_tokens` and a
/// tokenizer; with either missing the full log is always returned.
pub struct ConversationContext {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    max_tokens: Option<usize>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    pipeline: CompactionPipeline,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationContext {
    /// Create an unbounded context with the default compaction pipeline
    pub fn new() -> Self {
        Self {
            system_prompt: None,
            messages: Vec::new(),
            max_tokens: None,
            tokenizer: None,
            pipeline: CompactionPipeline::default(),
        }
    }

    /// Create a context using the budget and strategies from configuration
    pub fn from_config(config: &SessionConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self {
            system_prompt: None,
            messages: Vec::new(),
            max_tokens: config.max_tokens,
            tokenizer,
            pipeline: CompactionPipeline::new(config.compaction_strategies()),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<CompactionStrategy>) -> Self {
        self.pipeline = CompactionPipeline::new(strategies);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn set_system_prompt(&mut self, prompt: Option<String>) {
        self.system_prompt = prompt;
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Replace the tokenizer (e.g. after switching to a different model family)
    pub fn set_tokenizer(&mut self, tokenizer: Option<Arc<dyn Tokenizer>>) {
        self.tokenizer = tokenizer;
    }

    pub fn max_tokens(&self) -> Option<usize> {
        self.max_tokens
    }

    /// Validate and append a message. Invalid messages leave the log untouched.
    pub fn append(&mut self, message: Message) -> Result<()> {
        validate_message(&message)?;
        debug!(role = %message.role, position = self.messages.len(), "Appending message");
        self.messages.push(message);
        Ok(())
    }

    pub fn add_user_message(&mut self, text: impl Into<String>) -> Result<()> {
        self.append(Message::user(text))
    }

    pub fn add_user_parts(&mut self, parts: Vec<ContentPart>) -> Result<()> {
        self.append(Message::user_parts(parts))
    }

    pub fn add_assistant_message(
        &mut self,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Result<()> {
        if tool_calls.is_empty() {
            match content {
                Some(text) => self.append(Message::assistant(text)),
                None => self.append(Message::assistant_tool_calls(None, tool_calls)),
            }
        } else {
            self.append(Message::assistant_tool_calls(content, tool_calls))
        }
    }

    pub fn add_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.append(Message::tool(tool_call_id, tool_name, content))
    }

    /// Raw log, unbounded and without the system prompt
    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Clear the log; the system prompt is kept
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Total tokens for the system prompt and every message.
    ///
    /// `Unknown` when no tokenizer is bound or the tokenizer fails on anything.
    pub fn count_total_tokens(&self) -> TokenCount {
        let Some(tokenizer) = self.tokenizer.as_deref() else {
            return TokenCount::Unknown;
        };

        let meter = TokenMeter::new(tokenizer, self.system_prompt.as_deref());
        match meter.total(&self.messages) {
            Ok(total) => TokenCount::Known(total),
            Err(e) => {
                warn!(error = %e, "Token count failed; reporting unknown");
                TokenCount::Unknown
            }
        }
    }

    pub fn usage(&self) -> ContextUsage {
        ContextUsage {
            tokens: self.count_total_tokens(),
            max_tokens: self.max_tokens,
            messages: self.messages.len(),
        }
    }

    /// Compact the working log in place if it is over budget.
    ///
    /// Returns `None` when nothing ran: no budget, no tokenizer, already within
    /// budget, or the token count itself failed (enforcement is skipped for this call).
    pub fn compact(&mut self) -> Option<CompactionReport> {
        let budget = self.max_tokens?;
        let tokenizer = self.tokenizer.clone()?;

        let tokens = match self.count_total_tokens() {
            TokenCount::Known(n) => n,
            TokenCount::Unknown => {
                warn!("Token accounting failed; skipping budget enforcement for this call");
                return None;
            }
        };
        if tokens <= budget {
            return None;
        }

        let meter = TokenMeter::new(tokenizer.as_ref(), self.system_prompt.as_deref());
        let log = std::mem::take(&mut self.messages);
        let outcome = self.pipeline.run(log, &meter, budget, tokens);
        self.messages = outcome.messages;

        debug!(
            removed = outcome.report.removed,
            remaining = self.messages.len(),
            within_budget = outcome.report.within_budget,
            "Compacted conversation history"
        );
        Some(outcome.report)
    }

    /// Budget-respecting view: the system prompt (if any) followed by the log.
    ///
    /// Compaction mutates the working log, so later calls see the shortened history.
    pub fn bounded_view(&mut self) -> Vec<Message> {
        self.compact();
        self.formatted()
    }

    /// System prompt plus the current log, without enforcing the budget
    pub fn formatted(&self) -> Vec<Message> {
        let mut view = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            view.push(Message::system(prompt.clone()));
        }
        view.extend(self.messages.iter().cloned());
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokenizer::MESSAGE_OVERHEAD_TOKENS;
    use crate::context::types::MessageRole;
    use crate::ParleyError;

    struct LenTokenizer;

    impl Tokenizer for LenTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.len())
        }
    }

    /// Fails on any text containing "boom"
    struct FragileTokenizer;

    impl Tokenizer for FragileTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            if text.contains("boom") {
                Err(ParleyError::Tokenizer("unsupported input".to_string()))
            } else {
                Ok(text.len())
            }
        }
    }

    #[test]
    fn test_invalid_append_leaves_log_unchanged() {
        let mut ctx = ConversationContext::new();
        ctx.add_user_message("Hello").unwrap();
        let before = ctx.history().to_vec();

        assert!(ctx.add_user_message("").is_err());
        assert!(ctx.add_assistant_message(None, vec![]).is_err());
        assert!(ctx.add_tool_result("", "search", "x").is_err());

        assert_eq!(ctx.history(), before.as_slice());
    }

    #[test]
    fn test_same_message_twice_appends_twice() {
        let mut ctx = ConversationContext::new();
        let message = Message::user("again");

        ctx.append(message.clone()).unwrap();
        ctx.append(message.clone()).unwrap();

        assert_eq!(ctx.history(), &[message.clone(), message]);
    }

    #[test]
    fn test_count_without_tokenizer_is_unknown() {
        let mut ctx = ConversationContext::new().with_max_tokens(1);
        ctx.add_user_message("Hello").unwrap();
        assert_eq!(ctx.count_total_tokens(), TokenCount::Unknown);

        // Enforcement is skipped, nothing is dropped
        assert_eq!(ctx.bounded_view().len(), 1);
    }

    #[test]
    fn test_count_includes_system_prompt_and_overhead() {
        let mut ctx = ConversationContext::new()
            .with_tokenizer(Arc::new(LenTokenizer))
            .with_system_prompt("Be kind");
        ctx.add_user_message("Hello").unwrap();
        ctx.add_assistant_message(Some("Hi".to_string()), vec![]).unwrap();

        assert_eq!(
            ctx.count_total_tokens(),
            TokenCount::Known(7 + 5 + 2 + 2 * MESSAGE_OVERHEAD_TOKENS)
        );
    }

    #[test]
    fn test_tokenizer_failure_reports_unknown_and_skips_enforcement() {
        let mut ctx = ConversationContext::new()
            .with_tokenizer(Arc::new(FragileTokenizer))
            .with_max_tokens(5);
        ctx.add_user_message("first message").unwrap();
        ctx.add_user_message("boom").unwrap();
        ctx.add_user_message("third message").unwrap();

        assert_eq!(ctx.count_total_tokens(), TokenCount::Unknown);
        assert!(ctx.compact().is_none());
        assert_eq!(ctx.bounded_view().len(), 3);
    }

    #[test]
    fn test_bounded_view_prepends_system_prompt() {
        let mut ctx = ConversationContext::new().with_system_prompt("You are terse");
        ctx.add_user_message("Hello").unwrap();

        let view = ctx.bounded_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].role, MessageRole::System);
        assert_eq!(view[0].text(), Some("You are terse"));
        // The prompt is not part of the log
        assert_eq!(ctx.history().len(), 1);
    }

    #[test]
    fn test_compaction_mutates_working_log() {
        let mut ctx = ConversationContext::new()
            .with_tokenizer(Arc::new(LenTokenizer))
            .with_max_tokens(30)
            .with_strategies(vec![CompactionStrategy::OldestFirst { min_tail: 1 }]);
        for i in 0..6 {
            ctx.add_user_message(format!("turn{i}")).unwrap();
        }

        let view = ctx.bounded_view();
        assert_eq!(view.len(), 3);
        assert_eq!(ctx.history().len(), 3);
        assert_eq!(ctx.history()[0].text(), Some("turn3"));

        // Already within budget, a second call is stable
        assert!(ctx.compact().is_none());
        assert_eq!(ctx.bounded_view(), view);
    }

    #[test]
    fn test_reset_keeps_system_prompt() {
        let mut ctx = ConversationContext::new().with_system_prompt("sys");
        ctx.add_user_message("Hello").unwrap();
        ctx.reset();

        assert!(ctx.is_empty());
        assert_eq!(ctx.system_prompt(), Some("sys"));
    }

    #[test]
    fn test_usage_utilization() {
        let mut ctx = ConversationContext::new()
            .with_tokenizer(Arc::new(LenTokenizer))
            .with_max_tokens(100);
        ctx.add_user_message("x".repeat(46)).unwrap();

        let usage = ctx.usage();
        assert_eq!(usage.messages, 1);
        assert_eq!(usage.tokens, TokenCount::Known(50));
        assert_eq!(usage.utilization(), Some(0.5));
    }
}
