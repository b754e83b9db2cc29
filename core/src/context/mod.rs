//! Conversation Context
//!
//! Holds the message log for one conversation and produces a token-bounded view of it
//! on demand.
//!
//! # Architecture
//!
//! - **Types**: Message model (roles, multimodal content, tool calls)
//! - **Validation**: Role-specific shape checks applied before a message is appended
//! - **Tokenizer**: Pluggable token counting and the per-message accounting rules
//! - **Compaction**: Ordered strategies that shorten the log to fit a budget
//! - **Conversation**: The per-session context tying the pieces together

pub mod compaction;
pub mod conversation;
pub mod tokenizer;
pub mod types;
pub mod validation;

pub use compaction::{CompactionOutcome, CompactionPipeline, CompactionReport, CompactionStrategy};
pub use conversation::{ContextUsage, ConversationContext};
pub use tokenizer::{
    tokenizer_for_model, CharEstimateTokenizer, TokenCount, TokenMeter, Tokenizer,
    MESSAGE_OVERHEAD_TOKENS,
};
pub use types::{ContentPart, Message, MessageContent, MessageRole, ToolCall};
pub use validation::validate_message;
