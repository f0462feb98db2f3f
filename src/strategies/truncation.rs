//! Truncation: drop the archivable middle, keep the protected tail, re-admit
//! recent history while it fits the budget.

use tracing::debug;

use crate::message::{ChatMessage, Role};
use crate::tokens::{count_message_tokens, count_tokens};
use crate::trace::segment;

/// Truncate a trace to roughly `token_budget` tokens.
///
/// The pinned prefix, last user query, and tool episode are always kept,
/// even when they alone exceed the budget (floor behavior, not an error).
/// The archivable middle is re-admitted newest-first while the running
/// total stays within budget, then restored to chronological order.
/// Admission is per atomic unit, so a mid-trace tool episode is kept whole
/// or not at all.
pub fn truncate(
    messages: &[ChatMessage],
    token_budget: usize,
    model_name: &str,
) -> Vec<ChatMessage> {
    let segments = segment(messages);
    let floor = segments.protected_floor();
    let floor_tokens = count_tokens(&floor, model_name);

    let units = archivable_units(&segments.archivable);
    let mut remaining = token_budget.saturating_sub(floor_tokens);
    let mut kept_units: Vec<&[ChatMessage]> = Vec::new();
    for unit in units.iter().rev() {
        let cost: usize = unit
            .iter()
            .map(|m| count_message_tokens(m, model_name))
            .sum();
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_units.push(unit);
    }
    let kept: Vec<ChatMessage> = kept_units
        .into_iter()
        .rev()
        .flat_map(|unit| unit.iter().cloned())
        .collect();

    debug!(
        budget = token_budget,
        floor_tokens,
        kept = kept.len(),
        dropped = segments.archivable.len() - kept.len(),
        "truncated archivable middle"
    );

    let mut out = segments.pinned_prefix;
    out.extend(kept);
    out.extend(segments.last_user_query);
    out.extend(segments.tool_episode);
    out
}

/// Split an archivable run into atomic units: an assistant message with
/// tool calls owns the tool results that follow it; every other message
/// stands alone. An orphan tool message (its assistant already absent from
/// the input) is its own unit, kept as ordinary content.
fn archivable_units(messages: &[ChatMessage]) -> Vec<&[ChatMessage]> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let mut end = i + 1;
        if messages[i].has_tool_calls() {
            while end < messages.len() && messages[end].role == Role::Tool {
                end += 1;
            }
        }
        units.push(&messages[i..end]);
        i = end;
    }
    units
}
