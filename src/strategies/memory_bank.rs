//! Memory bank: externalize archivable history into a decaying vector store
//! and retrieve the most relevant pieces per turn.
//!
//! Retention follows the Ebbinghaus forgetting curve,
//! `R = exp(−Δt / (5 × strength))`, with Δt measured in turns since last
//! access. Retrieval reinforces: a recalled memory gets +1.0 strength and a
//! fresh access timestamp, so useful memories outlive idle ones.
//!
//! Externalization is one-way. After this strategy runs, the archivable
//! middle exists only inside the store; the output trace carries at most a
//! synthetic system message listing what was retrieved.

use std::collections::HashSet;

use tracing::{debug, error, info};

use crate::client::Embedder;
use crate::message::ChatMessage;
use crate::trace::segment;

/// Retention probability below which a node is forgotten.
const RETENTION_CUTOFF: f64 = 0.2;
/// Minimum cosine similarity for a retrieval hit.
const RELEVANCE_CUTOFF: f64 = 0.4;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One stored memory trace.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub content: String,
    pub embedding: Vec<f32>,
    pub strength: f64,
    pub created_turn: usize,
    pub last_accessed_turn: usize,
}

impl MemoryNode {
    /// Retention probability at the given turn.
    fn retention(&self, current_turn: usize) -> f64 {
        let elapsed = (current_turn - self.last_accessed_turn) as f64;
        (-elapsed / (5.0 * self.strength)).exp()
    }
}

/// Embedding-indexed store with spaced-repetition dynamics. Session-scoped;
/// never shared across conversations.
#[derive(Default)]
pub struct MemoryBank {
    nodes: Vec<MemoryNode>,
    /// Derived ids of everything ever stored: (message index, content
    /// length). Imperfect but bounded, and enough to stop re-storing the
    /// same middle turn after turn.
    seen: HashSet<(usize, usize)>,
    current_turn: usize,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the turn counter and apply the forgetting curve. Must run
    /// exactly once per turn, before retrieval.
    pub fn update_time(&mut self) {
        self.current_turn += 1;
        let before = self.nodes.len();
        let turn = self.current_turn;
        self.nodes.retain(|n| n.retention(turn) > RETENTION_CUTOFF);
        if self.nodes.len() != before {
            info!(
                dropped = before - self.nodes.len(),
                turn, "forgetting curve dropped memories"
            );
        }
    }

    /// Embed and store new content, skipping blanks and already-seen ids.
    /// Embedding failure is fail-soft: logged and skipped, eligible to
    /// retry next turn.
    pub async fn add_memory(
        &mut self,
        derived_id: (usize, usize),
        content: &str,
        embedder: &dyn Embedder,
        embedding_model: &str,
    ) {
        if content.trim().is_empty() || self.seen.contains(&derived_id) {
            return;
        }
        let embedding = match embedder.embed(embedding_model, content).await {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "embedding failed, memory not stored");
                return;
            }
        };
        self.seen.insert(derived_id);
        self.nodes.push(MemoryNode {
            content: content.to_string(),
            embedding,
            strength: 1.0,
            created_turn: self.current_turn,
            last_accessed_turn: self.current_turn,
        });
        debug!(turn = self.current_turn, total = self.nodes.len(), "memory stored");
    }

    /// Return the contents of the top-k most relevant memories above the
    /// relevance cutoff, reinforcing each hit.
    pub async fn retrieve(
        &mut self,
        query: &str,
        top_k: usize,
        embedder: &dyn Embedder,
        embedding_model: &str,
    ) -> Vec<String> {
        if self.nodes.is_empty() || query.trim().is_empty() {
            return Vec::new();
        }
        let query_vec = match embedder.embed(embedding_model, query).await {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "query embedding failed, retrieving nothing");
                return Vec::new();
            }
        };

        let mut scored: Vec<(f64, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (cosine_similarity(&query_vec, &n.embedding), i))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut retrieved = Vec::new();
        for (score, idx) in scored {
            if score <= RELEVANCE_CUTOFF {
                continue;
            }
            let node = &mut self.nodes[idx];
            node.strength += 1.0;
            node.last_accessed_turn = self.current_turn;
            retrieved.push(node.content.clone());
        }
        debug!(hits = retrieved.len(), turn = self.current_turn, "memory retrieval");
        retrieved
    }

    /// Drop all state for a fresh conversation.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.seen.clear();
        self.current_turn = 0;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

// ---------------------------------------------------------------------------
// Strategy application
// ---------------------------------------------------------------------------

/// Apply the memory-bank strategy to one turn: store the archivable middle,
/// advance time, retrieve against the current query, and reassemble the
/// trace without its middle.
pub async fn apply(
    messages: &[ChatMessage],
    bank: &mut MemoryBank,
    top_k: usize,
    embedding_model: &str,
    embedder: &dyn Embedder,
) -> Vec<ChatMessage> {
    let segments = segment(messages);

    for (i, msg) in segments.archivable.iter().enumerate() {
        let line = msg.transcript_line();
        bank.add_memory((i, line.len()), &line, embedder, embedding_model)
            .await;
    }

    bank.update_time();

    let query = segments
        .last_user_query
        .as_ref()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let memories = bank.retrieve(&query, top_k, embedder, embedding_model).await;

    let mut out = segments.pinned_prefix;
    if !memories.is_empty() {
        let listing = memories
            .iter()
            .map(|m| format!("- {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        out.push(ChatMessage::system(format!(
            "Relevant memories from earlier in this conversation:\n{listing}"
        )));
    }
    out.extend(segments.last_user_query);
    out.extend(segments.tool_episode);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Role, ToolCall};
    use async_trait::async_trait;

    /// Deterministic embedder: maps each text to a unit axis by keyword.
    /// Same-topic texts are identical vectors, cross-topic orthogonal.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, anyhow::Error> {
            let v = if text.contains("flight") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("hotel") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            };
            Ok(v)
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>, anyhow::Error> {
            anyhow::bail!("embedding backend offline")
        }
    }

    fn trace() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("travel agent"),
            ChatMessage::user("find me a flight to Tokyo"),
            ChatMessage::assistant("the flight NH218 looks good"),
            ChatMessage::user("what about a hotel"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "search_hotels", "{}")],
            ),
            ChatMessage::tool_result("c1", "hotel Okura available"),
        ]
    }

    #[tokio::test]
    async fn externalizes_middle_without_relevant_hits() {
        let mut bank = MemoryBank::new();
        // Stored middle is flight-topic, the query is hotel-topic: the
        // store fills but nothing clears the relevance cutoff.
        let out = apply(&trace(), &mut bank, 3, "test-embed", &KeywordEmbedder).await;

        assert!(!out.iter().any(|m| m.content.contains("NH218")));
        assert_eq!(bank.len(), 2);
        assert!(!out.iter().any(|m| m.content.starts_with("Relevant memories")));

        // Protected zones intact and ordered.
        assert_eq!(out[0].content, "travel agent");
        assert!(out.iter().any(|m| m.content == "what about a hotel"));
        assert!(out.last().unwrap().tool_call_id.is_some());
    }

    #[tokio::test]
    async fn relevant_query_gets_memories_injected() {
        let mut bank = MemoryBank::new();
        let msgs = vec![
            ChatMessage::system("travel agent"),
            ChatMessage::user("find me a flight to Tokyo"),
            ChatMessage::assistant("the flight NH218 looks good"),
            ChatMessage::user("book the flight now"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "book_flight", "{}")],
            ),
            ChatMessage::tool_result("c1", "booked"),
        ];
        let out = apply(&msgs, &mut bank, 3, "test-embed", &KeywordEmbedder).await;

        let mem_idx = out
            .iter()
            .position(|m| m.role == Role::System && m.content.starts_with("Relevant memories"))
            .expect("memories message injected");
        assert!(out[mem_idx].content.contains("NH218"));
        // Injected between pinned prefix and the query.
        let query_idx = out
            .iter()
            .position(|m| m.content == "book the flight now")
            .unwrap();
        assert!(mem_idx > 0 && mem_idx < query_idx);
    }

    #[tokio::test]
    async fn repeated_application_does_not_duplicate() {
        let mut bank = MemoryBank::new();
        let msgs = trace();
        apply(&msgs, &mut bank, 3, "test-embed", &KeywordEmbedder).await;
        let before = bank.len();
        apply(&msgs, &mut bank, 3, "test-embed", &KeywordEmbedder).await;
        assert_eq!(bank.len(), before);
    }

    #[tokio::test]
    async fn irrelevant_memories_stay_below_cutoff() {
        let mut bank = MemoryBank::new();
        bank.add_memory((0, 10), "the weather is sunny", &KeywordEmbedder, "m")
            .await;
        bank.update_time();
        let hits = bank.retrieve("find a flight", 3, &KeywordEmbedder, "m").await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn retrieval_reinforces_strength() {
        let mut bank = MemoryBank::new();
        bank.add_memory((0, 1), "flight A", &KeywordEmbedder, "m").await;
        bank.add_memory((1, 1), "hotel B", &KeywordEmbedder, "m").await;
        bank.update_time();

        // Recall only the flight memory.
        let hits = bank.retrieve("which flight", 1, &KeywordEmbedder, "m").await;
        assert_eq!(hits, vec!["flight A".to_string()]);

        // Age both without further access. The reinforced node must outlive
        // the idle one: exp(-t/5) dips under 0.2 near t=9, exp(-t/10) not
        // until t=17.
        for _ in 0..10 {
            bank.update_time();
        }
        assert_eq!(bank.len(), 1);
        let hits = bank.retrieve("which flight", 2, &KeywordEmbedder, "m").await;
        assert_eq!(hits, vec!["flight A".to_string()]);
    }

    #[tokio::test]
    async fn idle_memories_are_forgotten() {
        let mut bank = MemoryBank::new();
        bank.add_memory((0, 1), "flight A", &KeywordEmbedder, "m").await;
        // exp(-8/5) ≈ 0.202 keeps, exp(-9/5) ≈ 0.165 drops.
        for _ in 0..8 {
            bank.update_time();
        }
        assert_eq!(bank.len(), 1);
        bank.update_time();
        assert_eq!(bank.len(), 0);
    }

    #[tokio::test]
    async fn embedding_failure_is_fail_soft() {
        let mut bank = MemoryBank::new();
        let out = apply(&trace(), &mut bank, 3, "test-embed", &BrokenEmbedder).await;
        assert!(bank.is_empty());
        // Trace still reassembled: pinned + query + episode survive.
        assert_eq!(out[0].content, "travel agent");
        assert!(out.iter().any(|m| m.has_tool_calls()));
        assert!(!out.iter().any(|m| m.content.starts_with("Relevant memories")));
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let mut bank = MemoryBank::new();
        bank.add_memory((0, 1), "flight A", &KeywordEmbedder, "m").await;
        bank.update_time();
        bank.reset();
        assert!(bank.is_empty());
        // Same derived id stores again after reset.
        bank.add_memory((0, 1), "flight A", &KeywordEmbedder, "m").await;
        assert_eq!(bank.len(), 1);
    }
}
