//! Memory processor: the façade that owns per-session strategy state and
//! dispatches each turn's history to the configured compaction strategy.
//!
//! Per call: run loop detection on the tail, count tokens, then either pass
//! through (below threshold), or segment and dispatch. ACE is the exception
//! and engages on every turn regardless of token count, since it learns
//! rather than compacts. One processor per conversation; state must not be
//! shared across sessions.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::client::{ChatClient, Embedder};
use crate::config::{Config, StrategySettings};
use crate::message::{ChatMessage, Role};
use crate::strategies::ace::{self, AceConfig, AceState};
use crate::strategies::memory_bank::{self, MemoryBank};
use crate::strategies::progressive;
use crate::strategies::truncation;
use crate::strategies::CompactionOutcome;
use crate::tokens::count_tokens;
use crate::trace::detect_tail_loop;

/// Loop detection engages only for histories longer than this.
const LOOP_SCAN_MIN_MESSAGES: usize = 20;
const LOOP_REPEAT_THRESHOLD: usize = 4;
const LOOP_MAX_PATTERN_LEN: usize = 5;

/// Content of the synthetic message that replaces a looping history.
pub const LOOP_ABORT_MESSAGE: &str = "Infinite loop detected; aborting.";

/// Embedding model used when memory bank settings do not name one.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// True when `messages` is the loop-abort marker produced by
/// [`MemoryProcessor::apply_strategy`]. Terminal for the session, not
/// retryable.
pub fn is_loop_abort(messages: &[ChatMessage]) -> bool {
    messages.len() == 1
        && messages[0].role == Role::System
        && messages[0].content == LOOP_ABORT_MESSAGE
}

/// Owns the mutable strategy state for one conversation and applies the
/// strategy selected by key on each turn.
pub struct MemoryProcessor {
    config: Arc<Config>,
    bank: MemoryBank,
    ace_state: AceState,
}

impl MemoryProcessor {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            bank: MemoryBank::new(),
            ace_state: AceState::new(),
        }
    }

    /// Clear all strategy-scoped state. Callers invoke this between
    /// unrelated conversations that reuse the same processor.
    pub fn reset_state(&mut self) {
        self.bank.reset();
        self.ace_state.reset();
        info!("memory state reset");
    }

    /// Stored memory bank, for inspection.
    pub fn bank(&self) -> &MemoryBank {
        &self.bank
    }

    /// Current ACE state, for inspection.
    pub fn ace_state(&self) -> &AceState {
        &self.ace_state
    }

    /// Apply the strategy registered under `strategy_key` to `messages`.
    ///
    /// Fail-soft paths (unknown key, below threshold, loop abort) return a
    /// normal outcome; LLM-dependent strategies propagate their errors.
    pub async fn apply_strategy(
        &mut self,
        messages: &[ChatMessage],
        strategy_key: &str,
        model_key: &str,
        client: &dyn ChatClient,
        embedder: &dyn Embedder,
    ) -> anyhow::Result<CompactionOutcome> {
        let started = Instant::now();
        let tokens_before = count_tokens(messages, model_key);

        if messages.len() > LOOP_SCAN_MIN_MESSAGES
            && detect_tail_loop(messages, LOOP_REPEAT_THRESHOLD, LOOP_MAX_PATTERN_LEN)
        {
            error!(
                messages = messages.len(),
                "infinite loop detected in conversation tail, aborting session"
            );
            let out = vec![ChatMessage::system(LOOP_ABORT_MESSAGE)];
            let tokens_after = count_tokens(&out, model_key);
            return Ok(CompactionOutcome {
                messages: out,
                tokens_before,
                tokens_after,
            });
        }

        let Some(settings) = self.config.strategy(strategy_key) else {
            warn!(
                strategy = %strategy_key,
                "unknown strategy key, returning messages unchanged"
            );
            return Ok(CompactionOutcome {
                messages: messages.to_vec(),
                tokens_before,
                tokens_after: tokens_before,
            });
        };
        debug!(
            strategy = settings.kind(),
            tokens = tokens_before,
            threshold = self.config.compact_threshold,
            "applying memory strategy"
        );

        let transformed = match settings {
            // ACE engages every turn: it evolves a playbook rather than
            // compacting, so the threshold does not apply.
            StrategySettings::Ace {
                model,
                generator_model,
                reflector_model,
                curator_model,
                curator_frequency,
                playbook_token_budget,
            } => {
                let base = model.as_deref().unwrap_or(model_key);
                let cfg = AceConfig {
                    generator_model: generator_model.as_deref().unwrap_or(base).to_string(),
                    reflector_model: reflector_model.as_deref().unwrap_or(base).to_string(),
                    curator_model: curator_model.as_deref().unwrap_or(base).to_string(),
                    curator_frequency: *curator_frequency,
                    playbook_token_budget: *playbook_token_budget,
                };
                ace::apply(messages, &cfg, &mut self.ace_state, client).await?
            }
            _ if tokens_before <= self.config.compact_threshold => {
                debug!(
                    tokens = tokens_before,
                    threshold = self.config.compact_threshold,
                    "below compaction threshold, passthrough"
                );
                messages.to_vec()
            }
            StrategySettings::Truncation { max_tokens } => {
                let budget = max_tokens.unwrap_or(self.config.compact_threshold);
                truncation::truncate(messages, budget, model_key)
            }
            StrategySettings::MemoryBank {
                top_k,
                embedding_model,
            } => {
                let embedding_model = embedding_model
                    .as_deref()
                    .unwrap_or(DEFAULT_EMBEDDING_MODEL);
                memory_bank::apply(messages, &mut self.bank, *top_k, embedding_model, embedder)
                    .await
            }
            StrategySettings::ProgressiveSummarization { summarizer_model } => {
                let summarizer_model = summarizer_model.as_deref().unwrap_or(model_key);
                progressive::summarize(
                    messages,
                    tokens_before,
                    self.config.compact_threshold,
                    summarizer_model,
                    client,
                )
                .await?
            }
        };

        let tokens_after = count_tokens(&transformed, model_key);
        self.log_metrics(
            strategy_key,
            model_key,
            messages.len(),
            transformed.len(),
            tokens_before,
            tokens_after,
            started,
        );

        Ok(CompactionOutcome {
            messages: transformed,
            tokens_before,
            tokens_after,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn log_metrics(
        &self,
        strategy_key: &str,
        model_key: &str,
        messages_before: usize,
        messages_after: usize,
        tokens_before: usize,
        tokens_after: usize,
        started: Instant,
    ) {
        let delta = tokens_after as i64 - tokens_before as i64;
        let delta_pct = if tokens_before > 0 {
            round1(delta as f64 / tokens_before as f64 * 100.0)
        } else {
            0.0
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(window) = self.config.context_window(model_key) {
            info!(
                strategy = %strategy_key,
                tokens_before,
                tokens_after,
                token_delta = delta,
                token_delta_pct = delta_pct,
                messages_before,
                messages_after,
                utilization_before = round1(tokens_before as f64 / window as f64 * 100.0),
                utilization_after = round1(tokens_after as f64 / window as f64 * 100.0),
                duration_ms,
                "strategy applied"
            );
        } else {
            info!(
                strategy = %strategy_key,
                tokens_before,
                tokens_after,
                token_delta = delta,
                token_delta_pct = delta_pct,
                messages_before,
                messages_after,
                duration_ms,
                "strategy applied"
            );
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
