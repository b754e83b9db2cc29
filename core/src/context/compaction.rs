//! History Compaction
//!
//! Strategies that shorten a conversation log until it fits a token budget. Each
//! strategy is a pure transformation over the log; the pipeline applies them in
//! configured order and stops as soon as the budget is met.

use tracing::{debug, warn};

use super::tokenizer::{TokenCount, TokenMeter};
use super::types::Message;
use crate::Result;

/// A single compaction strategy.
///
/// Strategies only remove messages. Survivors keep their relative order and are
/// never modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Delete the oldest message after a protected prefix, keeping a protected suffix.
    MiddleRemoval {
        preserve_prefix: usize,
        preserve_suffix: usize,
    },

    /// Delete from the front of the log, never going below `min_tail` messages.
    OldestFirst { min_tail: usize },
}

impl CompactionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MiddleRemoval { .. } => "middle_removal",
            Self::OldestFirst { .. } => "oldest_first",
        }
    }

    /// Apply the strategy, returning the shortened log.
    ///
    /// The budget is re-checked after every single deletion, so the result
    /// overshoots the minimal necessary removal by at most one message.
    pub fn apply(
        &self,
        messages: &[Message],
        meter: &TokenMeter<'_>,
        budget: usize,
    ) -> Result<Vec<Message>> {
        let mut log = messages.to_vec();
        let mut costs = log
            .iter()
            .map(|m| meter.message_tokens(m))
            .collect::<Result<Vec<_>>>()?;
        // Per-message costs are independent, so the running total equals a full recount.
        let mut total = meter.base_tokens()? + costs.iter().sum::<usize>();

        match *self {
            Self::MiddleRemoval {
                preserve_prefix,
                preserve_suffix,
            } => {
                // The deletion slot stays at `preserve_prefix`; each removal slides the
                // next candidate into it until it would touch the suffix window.
                while total > budget && log.len() > preserve_prefix + preserve_suffix {
                    log.remove(preserve_prefix);
                    total -= costs.remove(preserve_prefix);
                }
            }
            Self::OldestFirst { min_tail } => {
                while total > budget && log.len() > min_tail {
                    log.remove(0);
                    total -= costs.remove(0);
                }
            }
        }

        Ok(log)
    }
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: TokenCount,
    pub removed: usize,
    /// Strategies that ran, in order
    pub applied: Vec<&'static str>,
    pub within_budget: bool,
}

/// Result of running the pipeline: the compacted log plus what happened to it
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub report: CompactionReport,
}

/// Ordered chain of compaction strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPipeline {
    strategies: Vec<CompactionStrategy>,
}

impl Default for CompactionPipeline {
    fn default() -> Self {
        Self::new(vec![
            CompactionStrategy::MiddleRemoval {
                preserve_prefix: 2,
                preserve_suffix: 4,
            },
            CompactionStrategy::OldestFirst { min_tail: 2 },
        ])
    }
}

impl CompactionPipeline {
    pub fn new(strategies: Vec<CompactionStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[CompactionStrategy] {
        &self.strategies
    }

    /// Run strategies in order against a log that currently measures `tokens_before`.
    ///
    /// Stops when the log fits the budget or a strategy fails. Ending over budget is
    /// not an error: the log is returned compacted as far as the strategies allow.
    pub fn run(
        &self,
        messages: Vec<Message>,
        meter: &TokenMeter<'_>,
        budget: usize,
        tokens_before: usize,
    ) -> CompactionOutcome {
        let original_len = messages.len();
        let mut current = messages;
        let mut tokens = TokenCount::Known(tokens_before);
        let mut applied = Vec::new();

        for strategy in &self.strategies {
            match tokens {
                TokenCount::Known(n) if n <= budget => break,
                TokenCount::Unknown => break,
                TokenCount::Known(_) => {}
            }

            match strategy.apply(&current, meter, budget) {
                Ok(next) => {
                    debug!(
                        strategy = strategy.name(),
                        before = current.len(),
                        after = next.len(),
                        "Applied compaction strategy"
                    );
                    current = next;
                    applied.push(strategy.name());
                    tokens = match meter.total(&current) {
                        Ok(n) => TokenCount::Known(n),
                        Err(e) => {
                            warn!(error = %e, "Token count failed after compaction");
                            TokenCount::Unknown
                        }
                    };
                }
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "Compaction strategy failed");
                    break;
                }
            }
        }

        let within_budget = matches!(tokens, TokenCount::Known(n) if n <= budget);
        if !within_budget {
            warn!(
                budget,
                tokens = ?tokens,
                remaining = current.len(),
                "History still over budget after compaction"
            );
        }

        let report = CompactionReport {
            tokens_before,
            tokens_after: tokens,
            removed: original_len - current.len(),
            applied,
            within_budget,
        };

        CompactionOutcome {
            messages: current,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokenizer::{Tokenizer, MESSAGE_OVERHEAD_TOKENS};

    struct LenTokenizer;

    impl Tokenizer for LenTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.len())
        }
    }

    fn numbered(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("msg{:02}", i))).collect()
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().filter_map(Message::text).collect()
    }

    // Each "msgNN" message costs 5 + overhead
    const COST: usize = 5 + MESSAGE_OVERHEAD_TOKENS;

    #[test]
    fn test_middle_removal_noop_when_short() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(4);
        let strategy = CompactionStrategy::MiddleRemoval {
            preserve_prefix: 2,
            preserve_suffix: 2,
        };

        let result = strategy.apply(&log, &meter, 0).unwrap();
        assert_eq!(result, log);
    }

    #[test]
    fn test_middle_removal_keeps_prefix_and_suffix() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(10);
        let strategy = CompactionStrategy::MiddleRemoval {
            preserve_prefix: 2,
            preserve_suffix: 3,
        };

        let result = strategy.apply(&log, &meter, 0).unwrap();
        assert_eq!(
            texts(&result),
            vec!["msg00", "msg01", "msg07", "msg08", "msg09"]
        );
    }

    #[test]
    fn test_middle_removal_stops_once_within_budget() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(8);
        let strategy = CompactionStrategy::MiddleRemoval {
            preserve_prefix: 1,
            preserve_suffix: 1,
        };

        let result = strategy.apply(&log, &meter, COST * 6).unwrap();
        assert_eq!(result.len(), 6);
        // Oldest interior messages go first
        assert_eq!(
            texts(&result),
            vec!["msg00", "msg03", "msg04", "msg05", "msg06", "msg07"]
        );
    }

    #[test]
    fn test_oldest_first_respects_floor() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(6);
        let strategy = CompactionStrategy::OldestFirst { min_tail: 2 };

        let result = strategy.apply(&log, &meter, 0).unwrap();
        assert_eq!(texts(&result), vec!["msg04", "msg05"]);
    }

    #[test]
    fn test_pipeline_falls_through_to_oldest_first() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(6);
        let pipeline = CompactionPipeline::new(vec![
            CompactionStrategy::MiddleRemoval {
                preserve_prefix: 1,
                preserve_suffix: 2,
            },
            CompactionStrategy::OldestFirst { min_tail: 1 },
        ]);

        let before = meter.total(&log).unwrap();
        let outcome = pipeline.run(log, &meter, COST, before);

        assert_eq!(texts(&outcome.messages), vec!["msg05"]);
        assert_eq!(outcome.report.applied, vec!["middle_removal", "oldest_first"]);
        assert_eq!(outcome.report.removed, 5);
        assert!(outcome.report.within_budget);
    }

    #[test]
    fn test_pipeline_stops_after_first_sufficient_strategy() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(8);
        let pipeline = CompactionPipeline::default();

        let before = meter.total(&log).unwrap();
        let outcome = pipeline.run(log, &meter, COST * 6, before);

        assert_eq!(outcome.report.applied, vec!["middle_removal"]);
        assert_eq!(outcome.messages.len(), 6);
        assert!(outcome.report.within_budget);
    }

    #[test]
    fn test_pipeline_exhaustion_is_not_an_error() {
        let meter = TokenMeter::new(&LenTokenizer, None);
        let log = numbered(5);
        let pipeline = CompactionPipeline::new(vec![CompactionStrategy::OldestFirst { min_tail: 3 }]);

        let before = meter.total(&log).unwrap();
        let outcome = pipeline.run(log, &meter, 1, before);

        assert_eq!(outcome.messages.len(), 3);
        assert!(!outcome.report.within_budget);
        assert_eq!(outcome.report.tokens_after, TokenCount::Known(COST * 3));
    }
}
