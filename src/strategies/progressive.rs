//! Progressive summarization: replace the archivable middle with one
//! LLM-written summary, regenerated in full on every pass.
//!
//! Fail-hard by contract: an LLM error or an empty summary propagates to
//! the caller. A silently empty summary would erase history without anyone
//! noticing, which is worse than a visible failure.

use anyhow::Context;
use tracing::debug;

use crate::client::ChatClient;
use crate::message::ChatMessage;
use crate::trace::segment;

/// System prompt for the summarization call.
const SUMMARY_PROMPT: &str = "Summarize the following agent conversation history into a compact \
briefing. Preserve stated goals, decisions made, tool calls and their results, entity names, \
identifiers, dates, and constraints. Omit greetings and filler. Respond with the summary only.";

/// Marker line prefixed to the injected summary message.
const SUMMARY_MARKER: &str = "[Conversation summary]";

/// Compress the archivable middle into a single system message.
///
/// Below `compact_threshold`, or when there is nothing archivable, the
/// input passes through unchanged. Otherwise the whole current middle is
/// re-serialized as role-prefixed lines and re-summarized from scratch;
/// the output keeps the user query ahead of the summary:
/// `pinned + query + summary + episode`.
pub async fn summarize(
    messages: &[ChatMessage],
    token_count: usize,
    compact_threshold: usize,
    summarizer_model: &str,
    client: &dyn ChatClient,
) -> anyhow::Result<Vec<ChatMessage>> {
    let segments = segment(messages);
    if token_count <= compact_threshold || segments.archivable.is_empty() {
        return Ok(messages.to_vec());
    }

    let history = segments
        .archivable
        .iter()
        .map(|m| m.transcript_line())
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = vec![
        ChatMessage::system(SUMMARY_PROMPT),
        ChatMessage::user(format!("Conversation history to compress:\n{history}")),
    ];

    let summary = client
        .complete(summarizer_model, &prompt)
        .await
        .context("summarization call failed")?;
    let summary = summary.trim();
    if summary.is_empty() {
        anyhow::bail!("summarization returned empty content");
    }

    debug!(
        archived = segments.archivable.len(),
        summary_chars = summary.len(),
        "archivable middle summarized"
    );

    let mut out = segments.pinned_prefix;
    out.extend(segments.last_user_query);
    out.push(ChatMessage::system(format!("{SUMMARY_MARKER}\n{summary}")));
    out.extend(segments.tool_episode);
    Ok(out)
}
