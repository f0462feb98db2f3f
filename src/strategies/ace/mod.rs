//! ACE (Agentic Context Engineering): instead of compacting history, evolve
//! a playbook of tagged heuristics and inject it as a system prefix on every
//! turn, independent of the token threshold.
//!
//! One step per call, three agents per step:
//! 1. Reflector (skipped on the first step) critiques the previous step and
//!    tags the bullets it used.
//! 2. Curator (step 1, then every `curator_frequency` steps) edits the
//!    playbook via ADD/REMOVE/UPDATE operations.
//! 3. Generator always runs; its reasoning trace and claimed bullet ids feed
//!    the next step's Reflector.
//!
//! LLM failures propagate as hard errors. A step that fails leaves whatever
//! state mutations already happened in place; the caller decides whether to
//! retry the turn.

pub mod agents;
pub mod playbook;

use tracing::debug;

use crate::client::ChatClient;
use crate::message::{ChatMessage, Role};

/// Instruction line placed above the serialized playbook.
const PLAYBOOK_HEADER: &str =
    "Consult this playbook of learned heuristics before responding; cite the bullet ids you apply.";

/// How many trailing messages the Generator sees as context.
const GENERATOR_CONTEXT_MESSAGES: usize = 3;
/// Per-message character cap for that context.
const GENERATOR_CONTEXT_CHARS: usize = 200;

/// Resolved model routing and cadence for one ACE session.
#[derive(Debug, Clone)]
pub struct AceConfig {
    pub generator_model: String,
    pub reflector_model: String,
    pub curator_model: String,
    pub curator_frequency: usize,
    pub playbook_token_budget: usize,
}

/// Mutable per-conversation state for the triad. Reset between episodes.
#[derive(Debug, Clone, PartialEq)]
pub struct AceState {
    pub playbook: String,
    /// Next bullet id to assign. Strictly increasing, never reused.
    pub next_id: u64,
    pub last_reflection: String,
    pub last_bullet_ids: Vec<u64>,
    pub last_reasoning_trace: String,
    pub last_predicted_answer: String,
    pub step_count: u64,
}

impl AceState {
    pub fn new() -> Self {
        Self {
            playbook: playbook::EMPTY_PLAYBOOK.to_string(),
            next_id: 1,
            last_reflection: String::new(),
            last_bullet_ids: Vec::new(),
            last_reasoning_trace: String::new(),
            last_predicted_answer: String::new(),
            step_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for AceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one ACE step and return the messages with the playbook prepended.
///
/// The original message list is never modified; the only output change is
/// one system message at the front carrying the current playbook (injected
/// even when the playbook is still the empty template).
pub async fn apply(
    messages: &[ChatMessage],
    cfg: &AceConfig,
    state: &mut AceState,
    client: &dyn ChatClient,
) -> anyhow::Result<Vec<ChatMessage>> {
    state.step_count += 1;
    let question = last_user_content(messages);
    let feedback = last_feedback_content(messages);

    if state.last_reasoning_trace.is_empty() {
        debug!(step = state.step_count, "reflector skipped, no prior trace");
    } else {
        let bullets_used = playbook::bullets_by_id(&state.playbook, &state.last_bullet_ids);
        let reflection = agents::reflect(
            &question,
            &state.last_reasoning_trace,
            &state.last_predicted_answer,
            &feedback,
            &bullets_used,
            &cfg.reflector_model,
            client,
        )
        .await?;
        if !reflection.tags.is_empty() {
            state.playbook = playbook::update_counts(&state.playbook, &reflection.tags);
        }
        debug!(
            step = state.step_count,
            tags = reflection.tags.len(),
            "reflection recorded"
        );
        state.last_reflection = reflection.text;
    }

    if state.step_count == 1 || state.step_count % cfg.curator_frequency as u64 == 0 {
        let stats = playbook::stats(&state.playbook);
        let operations = agents::curate(
            &state.playbook,
            &stats,
            &state.last_reflection,
            &question,
            state.step_count,
            cfg.playbook_token_budget,
            &cfg.curator_model,
            client,
        )
        .await?;
        if operations.is_empty() {
            debug!(step = state.step_count, "curator proposed no operations");
        } else {
            let (updated, next_id) =
                playbook::apply_operations(&state.playbook, &operations, state.next_id);
            debug!(
                step = state.step_count,
                operations = operations.len(),
                next_id,
                "curator operations applied"
            );
            state.playbook = updated;
            state.next_id = next_id;
        }
    }

    let context = recent_context(messages);
    let generation = agents::generate(
        &question,
        &state.playbook,
        &context,
        &state.last_reflection,
        &cfg.generator_model,
        client,
    )
    .await?;
    debug!(
        step = state.step_count,
        bullet_ids = ?generation.bullet_ids,
        "generator trace stored for next reflection"
    );
    state.last_bullet_ids = generation.bullet_ids;
    state.last_predicted_answer = generation.predicted_answer;
    state.last_reasoning_trace = generation.reasoning_trace;

    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(format!(
        "{PLAYBOOK_HEADER}\n\n{}",
        state.playbook
    )));
    out.extend_from_slice(messages);
    Ok(out)
}

fn last_user_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Newest user or tool message; what the environment "said" last.
fn last_feedback_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User | Role::Tool))
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn recent_context(messages: &[ChatMessage]) -> String {
    let start = messages.len().saturating_sub(GENERATOR_CONTEXT_MESSAGES);
    messages[start..]
        .iter()
        .map(|m| {
            format!(
                "{}: {}",
                m.role.as_str(),
                truncate_str(&m.content, GENERATOR_CONTEXT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
