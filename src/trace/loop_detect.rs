//! Tail loop detection: spot an agent stuck re-issuing the same turns.
//!
//! Matching is exact over normalized signatures. Volatile fields
//! (`tool_call_id`) are excluded because they differ even across genuinely
//! repeated actions; `function.arguments` is included, so retries with
//! changed arguments do not count as a loop.

use tracing::debug;

use crate::message::{ChatMessage, Role};

/// Normalized view of one message for pattern comparison:
/// role, content, and sorted `(type, name, arguments)` tool-call triples.
type Signature<'a> = (Role, &'a str, Option<Vec<(&'a str, &'a str, &'a str)>>);

fn signature(message: &ChatMessage) -> Signature<'_> {
    let tool_sig = message.tool_calls.as_ref().map(|tcs| {
        let mut sig: Vec<(&str, &str, &str)> = tcs
            .iter()
            .map(|tc| {
                (
                    tc.call_type.as_str(),
                    tc.function.name.as_str(),
                    tc.function.arguments.as_str(),
                )
            })
            .collect();
        sig.sort();
        sig
    });
    (message.role, message.content.as_str(), tool_sig)
}

/// Detect a repeating pattern at the tail of the conversation.
///
/// Looks at the last `max_pattern_len × repeat_threshold` messages only.
/// For each pattern length `L` from 1 up to `max_pattern_len`, the last `L`
/// messages are the candidate; the detector returns true when the preceding
/// `repeat_threshold − 1` blocks of length `L` all equal the candidate
/// exactly.
pub fn detect_tail_loop(
    messages: &[ChatMessage],
    repeat_threshold: usize,
    max_pattern_len: usize,
) -> bool {
    if repeat_threshold < 2 || max_pattern_len == 0 {
        return false;
    }
    if messages.len() < repeat_threshold {
        return false;
    }

    let window = max_pattern_len * repeat_threshold;
    let tail_start = messages.len().saturating_sub(window);
    let normalized: Vec<Signature> = messages[tail_start..].iter().map(signature).collect();
    let n = normalized.len();

    for pattern_len in 1..=max_pattern_len {
        if n < pattern_len * repeat_threshold {
            break;
        }
        let pattern = &normalized[n - pattern_len..];
        let repeats = (1..repeat_threshold).all(|k| {
            let block = &normalized[n - (k + 1) * pattern_len..n - k * pattern_len];
            block == pattern
        });
        if repeats {
            debug!(
                pattern_len,
                repeat_threshold, "repeating tail pattern detected"
            );
            return true;
        }
    }

    false
}
