//! baler: context-window compaction for tool-calling agent conversations.
//!
//! The crate takes an OpenAI-format message history that has outgrown its
//! budget and produces a shorter history that keeps the pinned prefix, the
//! latest user query, and whatever else the active strategy decides to keep:
//! plain truncation, an embedding-backed memory bank, progressive
//! summarization, or the ACE playbook loop.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod client;
pub mod config;
pub mod logs;
pub mod message;
pub mod processor;
pub mod session;
pub mod strategies;
pub mod tokens;
pub mod trace;

pub use client::{ChatClient, ChatResponse, Embedder, OpenAiClient, TokenUsage};
pub use config::{Config, ModelDef, StrategySettings};
pub use message::{ChatMessage, FunctionCall, Role, ToolCall};
pub use processor::MemoryProcessor;
pub use session::{Session, SessionRegistry};
pub use strategies::CompactionOutcome;
