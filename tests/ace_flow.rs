//! ACE driven through the `MemoryProcessor`: playbook evolution across
//! steps, per-agent model routing, and the always-engage contract.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use baler::client::{ChatClient, ChatResponse, Embedder};
use baler::config::Config;
use baler::message::{ChatMessage, Role};
use baler::processor::MemoryProcessor;
use baler::strategies::ace::playbook::EMPTY_PLAYBOOK;

const MODEL: &str = "gpt-4o-mini";

// ---------------------------------------------------------------------------
// Scripted triad client
// ---------------------------------------------------------------------------

/// Routes on the agent named in the system prompt. Curator replies are a
/// queue, so each curator step can propose different operations.
struct TriadClient {
    curator_replies: Mutex<VecDeque<String>>,
    reflector_reply: String,
    generator_reply: String,
    calls: Mutex<Vec<(String, String)>>,
}

impl TriadClient {
    fn new(curator_replies: &[&str], reflector: &str, generator: &str) -> Self {
        Self {
            curator_replies: Mutex::new(
                curator_replies.iter().map(|s| s.to_string()).collect(),
            ),
            reflector_reply: reflector.to_string(),
            generator_reply: generator.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn models_for(&self, agent: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, prompt)| prompt.contains(&format!("the {agent} agent")))
            .map(|(model, _)| model.clone())
            .collect()
    }
}

#[async_trait]
impl ChatClient for TriadClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, anyhow::Error> {
        let prompt = messages[0].content.clone();
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.clone()));
        if prompt.contains("the curator agent") {
            Ok(self
                .curator_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| r#"{"operations": []}"#.to_string()))
        } else if prompt.contains("the reflector agent") {
            Ok(self.reflector_reply.clone())
        } else {
            Ok(self.generator_reply.clone())
        }
    }

    async fn complete_with_tools(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: &[serde_json::Value],
        _tool_choice: Option<&str>,
    ) -> Result<ChatResponse, anyhow::Error> {
        anyhow::bail!("not used in this test")
    }
}

struct UnusedEmbedder;

#[async_trait]
impl Embedder for UnusedEmbedder {
    async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>, anyhow::Error> {
        anyhow::bail!("unexpected embedding call")
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config() -> Arc<Config> {
    Arc::new(
        Config::from_yaml(
            r#"
compact_threshold: 500
strategies:
  ace:
    type: ace
    generator_model: gen-x
    reflector_model: refl-x
    curator_model: cur-x
    curator_frequency: 2
models:
  gpt-4o-mini:
    context_window: 128000
"#,
        )
        .unwrap(),
    )
}

fn conversation() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("maze navigation agent"),
        ChatMessage::user("find the exit"),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn playbook_evolves_and_never_reuses_ids() {
    // Curator runs on steps 1, 2, and 4 (frequency 2). It adds bullets 1
    // and 2, removes 1 while adding 3, then adds 4.
    let client = TriadClient::new(
        &[
            r#"{"operations": [
                {"op": "ADD", "section": "Tool Usage", "content": "check tool schemas"},
                {"op": "ADD", "section": "Error Handling & Recovery", "content": "retry idempotent calls once"}
            ]}"#,
            r#"{"operations": [
                {"op": "REMOVE", "bullet_id": 1},
                {"op": "ADD", "section": "Tool Usage", "content": "prefer batch endpoints"}
            ]}"#,
            r#"{"operations": [
                {"op": "ADD", "section": "Reasoning Patterns", "content": "verify grid bounds first"}
            ]}"#,
        ],
        r#"{"reflection": "retries kept the run alive", "bullet_tags": [{"bullet_id": 2, "tag": "helpful"}]}"#,
        "Follow the left wall.\n{\"answer\": \"go left\", \"bullet_ids_used\": [2]}",
    );
    let mut processor = MemoryProcessor::new(config());
    let msgs = conversation();

    for _ in 0..4 {
        let outcome = processor
            .apply_strategy(&msgs, "ace", MODEL, &client, &UnusedEmbedder)
            .await
            .unwrap();
        // Playbook prefix, then the conversation untouched.
        assert_eq!(outcome.messages[0].role, Role::System);
        assert!(outcome.messages[0]
            .content
            .contains("playbook of learned heuristics"));
        assert_eq!(&outcome.messages[1..], &msgs[..]);
    }

    let state = processor.ace_state();
    assert_eq!(state.step_count, 4);
    assert_eq!(state.next_id, 5);

    // Bullet 1 was removed and its id never reassigned; the reflector
    // tagged bullet 2 helpful on each of steps 2-4.
    assert!(!state.playbook.contains("[1] "));
    assert!(state
        .playbook
        .contains("[2] helpful=3 harmful=0 :: retry idempotent calls once"));
    assert!(state
        .playbook
        .contains("[3] helpful=0 harmful=0 :: prefer batch endpoints"));
    assert!(state
        .playbook
        .contains("[4] helpful=0 harmful=0 :: verify grid bounds first"));
}

#[tokio::test]
async fn each_agent_uses_its_configured_model() {
    let client = TriadClient::new(
        &[],
        r#"{"reflection": "ok", "bullet_tags": []}"#,
        "thinking\nBULLET_IDS: []",
    );
    let mut processor = MemoryProcessor::new(config());
    let msgs = conversation();

    for _ in 0..2 {
        processor
            .apply_strategy(&msgs, "ace", MODEL, &client, &UnusedEmbedder)
            .await
            .unwrap();
    }

    assert_eq!(client.models_for("curator"), ["cur-x", "cur-x"]);
    assert_eq!(client.models_for("reflector"), ["refl-x"]);
    assert_eq!(client.models_for("generator"), ["gen-x", "gen-x"]);
}

#[tokio::test]
async fn ace_engages_below_the_compaction_threshold() {
    let client = TriadClient::new(&[], "unused", "ok\nBULLET_IDS: []");
    let mut processor = MemoryProcessor::new(config());
    let msgs = conversation();

    // Two messages is nowhere near 500 tokens, yet the playbook still
    // lands in front.
    let outcome = processor
        .apply_strategy(&msgs, "ace", MODEL, &client, &UnusedEmbedder)
        .await
        .unwrap();
    assert_eq!(outcome.messages.len(), msgs.len() + 1);
    assert!(outcome.tokens_after > outcome.tokens_before);
}

#[tokio::test]
async fn reset_state_restarts_the_playbook() {
    let client = TriadClient::new(
        &[
            r#"{"operations": [{"op": "ADD", "section": "Tool Usage", "content": "check tool schemas"}]}"#,
        ],
        "unused",
        "ok\nBULLET_IDS: [1]",
    );
    let mut processor = MemoryProcessor::new(config());
    let msgs = conversation();

    processor
        .apply_strategy(&msgs, "ace", MODEL, &client, &UnusedEmbedder)
        .await
        .unwrap();
    assert_ne!(processor.ace_state().playbook, EMPTY_PLAYBOOK);

    processor.reset_state();
    assert_eq!(processor.ace_state().playbook, EMPTY_PLAYBOOK);
    assert_eq!(processor.ace_state().step_count, 0);
    assert_eq!(processor.ace_state().next_id, 1);
}

#[tokio::test]
async fn curator_failure_surfaces_to_the_caller() {
    struct FailingClient;

    #[async_trait]
    impl ChatClient for FailingClient {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
        ) -> Result<String, anyhow::Error> {
            anyhow::bail!("backend down")
        }

        async fn complete_with_tools(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: &[serde_json::Value],
            _tool_choice: Option<&str>,
        ) -> Result<ChatResponse, anyhow::Error> {
            anyhow::bail!("backend down")
        }
    }

    let mut processor = MemoryProcessor::new(config());
    let err = processor
        .apply_strategy(
            &conversation(),
            "ace",
            MODEL,
            &FailingClient,
            &UnusedEmbedder,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("curator call failed"));
}
