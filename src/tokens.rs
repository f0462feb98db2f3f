//! Token counting: real BPE tokenisation via `tiktoken-rs`, keyed by model
//! family.
//!
//! Counts `content` plus, for tool-calling turns, each call's function name
//! and argument string. Content-only counting undercounts tool-heavy turns
//! badly, and the compaction threshold decisions downstream depend on the
//! count being honest about what actually goes over the wire.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::message::ChatMessage;

// ---------------------------------------------------------------------------
// Encoder selection
// ---------------------------------------------------------------------------

/// Cached o200k_base tokenizer (GPT-4o / GPT-4.1 / o1 / o3 / GPT-5 family).
fn o200k() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| o200k_base().expect("failed to load o200k_base tokeniser"))
}

/// Cached cl100k_base tokenizer (GPT-4 / GPT-3.5 family, universal fallback).
fn cl100k() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().expect("failed to load cl100k_base tokeniser"))
}

/// Strip a router-style `provider/` prefix and lowercase.
///
/// Gateway configs often name models like `openai/gpt-4.1-mini`; the part
/// after the slash is what keys the tokenizer family.
fn normalize_model_name(model_name: &str) -> String {
    let name = match model_name.split_once('/') {
        Some((_, rest)) => rest,
        None => model_name,
    };
    name.to_ascii_lowercase()
}

/// Pick the BPE encoder for a model name. Unrecognized names fall back to
/// `cl100k_base`, which is safe for threshold decisions even when inexact.
fn encoder_for(model_name: &str) -> &'static CoreBPE {
    let name = normalize_model_name(model_name);
    if name.contains("gpt-4o")
        || name.contains("gpt-4.1")
        || name.starts_with("gpt-5")
        || name.starts_with("o1")
        || name.starts_with("o3")
        || name.starts_with("o4")
    {
        o200k()
    } else {
        cl100k()
    }
}

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

/// Token count for a single string under the given model's encoding.
pub fn count_text_tokens(text: &str, model_name: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    encoder_for(model_name).encode_with_special_tokens(text).len()
}

/// Token count for one message: content plus tool-call names and arguments.
pub fn count_message_tokens(message: &ChatMessage, model_name: &str) -> usize {
    let enc = encoder_for(model_name);
    let mut count = 0;
    if !message.content.is_empty() {
        count += enc.encode_with_special_tokens(&message.content).len();
    }
    if let Some(ref tool_calls) = message.tool_calls {
        for tc in tool_calls {
            if !tc.function.name.is_empty() {
                count += enc.encode_with_special_tokens(&tc.function.name).len();
            }
            if !tc.function.arguments.is_empty() {
                count += enc.encode_with_special_tokens(&tc.function.arguments).len();
            }
        }
    }
    count
}

/// Total token count for a slice of messages.
pub fn count_tokens(messages: &[ChatMessage], model_name: &str) -> usize {
    messages
        .iter()
        .map(|m| count_message_tokens(m, model_name))
        .sum()
}
