//! OpenAI-compatible HTTP adapter.
//!
//! Works with any API implementing the OpenAI chat completions and
//! embeddings interface: OpenAI itself, OpenRouter, LiteLLM gateways,
//! Ollama, vLLM, etc.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{parse_chat_response, ChatClient, ChatResponse, Embedder};
use crate::message::{serialize_messages, ChatMessage};

/// Client for an OpenAI-compatible server.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiClient {
    /// Create a client for the given base URL (e.g.
    /// `https://api.openai.com/v1`).
    ///
    /// `api_key` may be empty for local servers that don't require auth.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(90))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let mut req = self.client.post(self.url(path)).json(body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat API returned {status}: {text}");
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, anyhow::Error> {
        let body = json!({
            "model": model,
            "messages": serialize_messages(messages),
        });
        let json = self.post_json("chat/completions", &body).await?;
        Ok(parse_chat_response(&json)?.message.content)
    }

    async fn complete_with_tools(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        tool_choice: Option<&str>,
    ) -> Result<ChatResponse, anyhow::Error> {
        let mut body = json!({
            "model": model,
            "messages": serialize_messages(messages),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
            body["tool_choice"] = json!(tool_choice.unwrap_or("auto"));
        }
        let json = self.post_json("chat/completions", &body).await?;
        parse_chat_response(&json)
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, anyhow::Error> {
        let body = json!({
            "model": model,
            "input": text,
        });
        let json = self.post_json("embeddings", &body).await?;
        let embedding = json
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("embeddings response has no data[0].embedding"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_handles_trailing_slash() {
        let a = OpenAiClient::new("http://localhost:4000/v1", "");
        let b = OpenAiClient::new("http://localhost:4000/v1/", "");
        assert_eq!(a.url("chat/completions"), b.url("chat/completions"));
        assert_eq!(
            a.url("embeddings"),
            "http://localhost:4000/v1/embeddings"
        );
    }

    #[test]
    fn construct_with_empty_key() {
        let c = OpenAiClient::new("http://localhost:11434/v1", String::new());
        assert!(c.api_key.is_empty());
    }

    #[tokio::test]
    async fn complete_fails_without_server() {
        let c = OpenAiClient::new("http://127.0.0.1:1/v1", "");
        let msgs = vec![ChatMessage::user("hi")];
        assert!(c.complete("test", &msgs).await.is_err());
    }

    #[tokio::test]
    async fn embed_fails_without_server() {
        let c = OpenAiClient::new("http://127.0.0.1:1/v1", "");
        assert!(c.embed("test-embed", "some text").await.is_err());
    }
}
