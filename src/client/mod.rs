//! LLM boundary abstractions.
//!
//! Defines the [`ChatClient`] and [`Embedder`] traits the strategies depend
//! on, the normalized [`ChatResponse`] shape, and the parsing helpers that
//! turn OpenAI-style response JSON into it. Nothing outside this module
//! inspects provider JSON; the adapter normalizes first.

pub mod openai;

use async_trait::async_trait;

use crate::message::{ChatMessage, Role, ToolCall};

pub use openai::OpenAiClient;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Chat-completion boundary. Implementations may hit the network; errors
/// propagate to the caller untouched (retry is a caller concern).
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send messages and return the assistant's plain-text reply.
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, anyhow::Error>;

    /// Send messages with tool definitions and return the full normalized
    /// response.
    async fn complete_with_tools(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        tool_choice: Option<&str>,
    ) -> Result<ChatResponse, anyhow::Error>;
}

/// Embedding boundary: text in, fixed-length vector out. Deterministic per
/// model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, anyhow::Error>;
}

// ---------------------------------------------------------------------------
// Normalized response
// ---------------------------------------------------------------------------

/// Token usage statistics returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One completion, normalized into the crate's canonical message type.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant turn, with tool calls parsed when present.
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Parse an OpenAI-style chat completion body into a [`ChatResponse`].
///
/// Tolerates `content: null` and absent `tool_calls`; fails only when no
/// choice is present at all.
pub fn parse_chat_response(json: &serde_json::Value) -> Result<ChatResponse, anyhow::Error> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow::anyhow!("chat response has no choices[0].message"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls: Option<Vec<ToolCall>> = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| serde_json::from_value(tc.clone()).ok())
                .collect::<Vec<ToolCall>>()
        })
        .filter(|tcs: &Vec<ToolCall>| !tcs.is_empty());

    let finish_reason = json["choices"][0]["finish_reason"]
        .as_str()
        .map(str::to_string);

    Ok(ChatResponse {
        message: ChatMessage {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        },
        finish_reason,
        usage: parse_token_usage(json),
    })
}

/// Extract token usage statistics from an OpenAI-style response JSON.
pub fn parse_token_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}
