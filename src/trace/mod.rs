//! Trace segmentation: parse a flat message history into semantic zones.
//!
//! Every compaction strategy starts from the same four-way split:
//! 1. **Pinned prefix**: leading `system` messages, never compacted.
//! 2. **Last user query**: the question the agent is currently working on.
//! 3. **Tool episode**: the trailing assistant tool-call turn plus all of
//!    its tool results, kept atomic so the downstream API never sees an
//!    orphaned tool message.
//! 4. **Archivable**: everything else, the compactable middle.
//!
//! Segmentation is a total function: malformed structure degrades to the
//! most conservative split (more archivable, less protected) with an error
//! log, never a panic or an `Err`.

pub mod loop_detect;

pub use loop_detect::detect_tail_loop;

use std::collections::HashSet;

use tracing::{error, warn};

use crate::message::{ChatMessage, Role};

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// Output of [`segment`]. Recomputed fresh on every call, never persisted.
#[derive(Debug, Clone, Default)]
pub struct Segments {
    /// Maximal leading run of `system` messages.
    pub pinned_prefix: Vec<ChatMessage>,
    /// The most recent user message, when one exists.
    pub last_user_query: Option<ChatMessage>,
    /// The compactable middle, in original order.
    pub archivable: Vec<ChatMessage>,
    /// Validated trailing tool episode: one assistant-with-tool_calls
    /// message plus its tool results. Empty when absent or invalid.
    pub tool_episode: Vec<ChatMessage>,
}

impl Segments {
    /// The protected set every strategy keeps verbatim: pinned prefix,
    /// query, and tool episode, in reassembly order.
    pub fn protected_floor(&self) -> Vec<ChatMessage> {
        let mut floor = self.pinned_prefix.clone();
        floor.extend(self.last_user_query.clone());
        floor.extend(self.tool_episode.iter().cloned());
        floor
    }

    /// Total number of messages across all four parts.
    pub fn len(&self) -> usize {
        self.pinned_prefix.len()
            + usize::from(self.last_user_query.is_some())
            + self.archivable.len()
            + self.tool_episode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// Split a message history into pinned prefix, last user query, archivable
/// middle, and trailing tool episode.
///
/// The four parts cover the input exactly: nothing is dropped, nothing is
/// duplicated. An invalidated episode is folded into `archivable` rather
/// than protected.
pub fn segment(messages: &[ChatMessage]) -> Segments {
    let mut segments = Segments::default();
    if messages.is_empty() {
        return segments;
    }

    let pinned_len = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    segments.pinned_prefix = messages[..pinned_len].to_vec();

    // Trailing tool episode: a run of tool messages preceded by the
    // assistant turn that issued them.
    let episode_start = find_tool_episode(messages, pinned_len);
    if let Some(start) = episode_start {
        segments.tool_episode = messages[start..].to_vec();
    }
    let tail_start = episode_start.unwrap_or(messages.len());

    // Last user query: nearest user message before the episode, or the
    // last one anywhere when there is no episode.
    let query_idx = messages[pinned_len..tail_start]
        .iter()
        .rposition(|m| m.role == Role::User)
        .map(|i| i + pinned_len);
    if query_idx.is_none() {
        warn!("no user message found in trace, query segment left empty");
    }
    segments.last_user_query = query_idx.map(|i| messages[i].clone());

    // Everything not claimed above is archivable, original order kept.
    for (i, m) in messages.iter().enumerate().take(tail_start).skip(pinned_len) {
        if Some(i) != query_idx {
            segments.archivable.push(m.clone());
        }
    }

    segments
}

/// Locate a valid trailing tool episode, returning the index of its
/// assistant message. `None` means no episode (or an invalid one, already
/// logged).
fn find_tool_episode(messages: &[ChatMessage], pinned_len: usize) -> Option<usize> {
    let n = messages.len();
    let mut tool_start = n;
    while tool_start > pinned_len && messages[tool_start - 1].role == Role::Tool {
        tool_start -= 1;
    }
    if tool_start == n {
        return None;
    }
    if tool_start <= pinned_len {
        error!("tool messages found at start of conversation, treating as archivable");
        return None;
    }

    let assistant_idx = tool_start - 1;
    let assistant = &messages[assistant_idx];
    if assistant.role != Role::Assistant {
        error!(
            found = assistant.role.as_str(),
            "expected assistant before trailing tool messages, treating as archivable"
        );
        return None;
    }

    let Some(tool_calls) = assistant.tool_calls.as_ref().filter(|tcs| !tcs.is_empty()) else {
        error!("assistant before trailing tool messages carries no tool_calls, treating as archivable");
        return None;
    };

    // A call that lost its id or function name in transit marks a corrupted
    // payload; the episode cannot be trusted as atomic.
    if tool_calls
        .iter()
        .any(|tc| tc.id.is_empty() || tc.function.name.is_empty())
    {
        error!("trailing tool episode has corrupted tool_calls payload, treating as archivable");
        return None;
    }

    let call_ids: HashSet<&str> = tool_calls.iter().map(|tc| tc.id.as_str()).collect();
    let unmatched: Vec<&str> = messages[tool_start..]
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .filter(|id| !call_ids.contains(id))
        .collect();
    if !unmatched.is_empty() {
        error!(
            ids = ?unmatched,
            "tool result ids not found in assistant tool_calls, treating episode as archivable"
        );
        return None;
    }
    if messages[tool_start..].iter().any(|m| m.tool_call_id.is_none()) {
        error!("tool result without tool_call_id in trailing episode, treating as archivable");
        return None;
    }

    Some(assistant_idx)
}
