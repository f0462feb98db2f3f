//! Session orchestration: one strategy-state instance per conversation,
//! plus the registry that routes session ids to them.
//!
//! A `Session` wires a [`MemoryProcessor`] between the caller's message
//! history and the chat client: every `generate` call first applies the
//! active compaction strategy, then forwards the transformed history to the
//! model. Sessions are never shared across conversations; the registry hands
//! out one per id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::client::{ChatClient, ChatResponse, Embedder};
use crate::config::Config;
use crate::message::ChatMessage;
use crate::processor::{is_loop_abort, MemoryProcessor};
use crate::strategies::CompactionOutcome;

/// Finish reason reported when a turn is cut short by loop detection.
pub const LOOP_ABORT_FINISH_REASON: &str = "loop_abort";

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One conversation: active model/strategy keys plus the processor that
/// owns this conversation's strategy state.
pub struct Session {
    config: Arc<Config>,
    client: Arc<dyn ChatClient>,
    embedder: Arc<dyn Embedder>,
    processor: MemoryProcessor,
    model_key: String,
    strategy_key: String,
}

impl Session {
    /// Build a session for `model_key` / `strategy_key`, validating both
    /// against the config registries.
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn ChatClient>,
        embedder: Arc<dyn Embedder>,
        model_key: &str,
        strategy_key: &str,
    ) -> anyhow::Result<Self> {
        let mut session = Self {
            processor: MemoryProcessor::new(Arc::clone(&config)),
            config,
            client,
            embedder,
            model_key: String::new(),
            strategy_key: String::new(),
        };
        session.set_active_context(model_key, strategy_key)?;
        Ok(session)
    }

    /// Switch the active model and strategy. Errors on keys the config does
    /// not know; the previous context stays active in that case.
    pub fn set_active_context(
        &mut self,
        model_key: &str,
        strategy_key: &str,
    ) -> anyhow::Result<()> {
        if !self.config.models.contains_key(model_key) {
            anyhow::bail!("session: unknown model key '{model_key}'");
        }
        if self.config.strategy(strategy_key).is_none() {
            anyhow::bail!("session: unknown strategy key '{strategy_key}'");
        }
        info!(model = %model_key, strategy = %strategy_key, "session context set");
        self.model_key = model_key.to_string();
        self.strategy_key = strategy_key.to_string();
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        &self.model_key
    }

    pub fn active_strategy(&self) -> &str {
        &self.strategy_key
    }

    /// Clear all strategy-scoped state before reusing this session for an
    /// unrelated conversation.
    pub fn reset_session(&mut self) {
        self.processor.reset_state();
    }

    /// Apply the active strategy to `messages` without calling the model.
    pub async fn compact(&mut self, messages: &[ChatMessage]) -> anyhow::Result<CompactionOutcome> {
        self.processor
            .apply_strategy(
                messages,
                &self.strategy_key,
                &self.model_key,
                self.client.as_ref(),
                self.embedder.as_ref(),
            )
            .await
    }

    /// Compact, then forward the transformed history to the chat client.
    ///
    /// A loop abort short-circuits without calling the model; the returned
    /// response carries the abort marker with finish reason
    /// [`LOOP_ABORT_FINISH_REASON`], terminal for this session.
    pub async fn generate(
        &mut self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        tool_choice: Option<&str>,
    ) -> anyhow::Result<ChatResponse> {
        let outcome = self.compact(messages).await?;
        if is_loop_abort(&outcome.messages) {
            debug!("loop abort, skipping model call");
            return Ok(ChatResponse {
                message: outcome.messages[0].clone(),
                finish_reason: Some(LOOP_ABORT_FINISH_REASON.to_string()),
                usage: None,
            });
        }
        self.client
            .complete_with_tools(&self.model_key, &outcome.messages, tools, tool_choice)
            .await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Routes each session id to its own [`Session`], so concurrent
/// conversations never share mutable strategy state.
pub struct SessionRegistry {
    config: Arc<Config>,
    client: Arc<dyn ChatClient>,
    embedder: Arc<dyn Embedder>,
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn ChatClient>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            client,
            embedder,
            sessions: HashMap::new(),
        }
    }

    /// The session for `id`, creating it with the config's default model and
    /// strategy when absent. Errors when defaults are missing from config.
    pub fn session(&mut self, id: &str) -> anyhow::Result<&mut Session> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let model = self
                    .config
                    .default_model
                    .clone()
                    .context("config: default_model is required to auto-create sessions")?;
                let strategy = self
                    .config
                    .default_strategy
                    .clone()
                    .context("config: default_strategy is required to auto-create sessions")?;
                let session = Session::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.client),
                    Arc::clone(&self.embedder),
                    &model,
                    &strategy,
                )?;
                info!(session = %id, model = %model, strategy = %strategy, "session created");
                Ok(entry.insert(session))
            }
        }
    }

    /// Create a session under a freshly generated UUIDv4 id and return the
    /// id. Uses the config's default model and strategy.
    pub fn create_session(&mut self) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.session(&id)?;
        Ok(id)
    }

    /// Drop a finished session and its state.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
