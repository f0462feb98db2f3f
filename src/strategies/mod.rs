//! Compaction strategies.
//!
//! Four interchangeable algorithms over the same segmented input, with
//! deliberately different failure behavior: truncation and memory bank are
//! fail-soft (malformed input degrades, never errors), progressive
//! summarization and ACE are fail-hard on their LLM dependency.

pub mod ace;
pub mod memory_bank;
pub mod progressive;
pub mod truncation;

use crate::message::ChatMessage;

/// Result of one strategy application, with token accounting the caller can
/// report alongside the transformed history.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub messages: Vec<ChatMessage>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompactionOutcome {
    /// Tokens removed by the strategy (zero when it grew the trace, as ACE
    /// does).
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}
