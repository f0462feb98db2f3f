//! The Generator / Reflector / Curator agents: prompt assembly and tolerant
//! parsing of the structured fields in their replies.
//!
//! All three talk to the LLM boundary in free text. Structured fields are
//! recovered by trying strict JSON first (whole reply, then a ```json fence,
//! then any balanced `{...}` span) and falling back to lighter markers such
//! as `BULLET_IDS: [...]`, because LLM output is not guaranteed well-formed.
//! Transport errors propagate; parse failures degrade to empty results.

use anyhow::Context;
use serde_json::Value;

use crate::client::ChatClient;
use crate::message::ChatMessage;
use crate::strategies::ace::playbook::{BulletTag, CuratorOp, PlaybookStats};

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

const GENERATOR_PROMPT: &str = "\
You are the generator agent for a task-solving assistant. Use the playbook \
bullets below to guide your reasoning, then address the current question.

PLAYBOOK:
{playbook}

RECENT REFLECTION:
{reflection}

CONTEXT:
{context}

QUESTION:
{question}

Reason step by step. End your reply with a JSON object of the form \
{\"answer\": \"<your final answer>\", \"bullet_ids_used\": [<ids of playbook \
bullets you relied on>]}. If you used no bullets, pass an empty list. If you \
cannot emit JSON, end with a single line: BULLET_IDS: [ids]";

/// What the Generator produced for this step; feeds the next Reflector.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Raw reply text, kept whole as the reasoning trace.
    pub reasoning_trace: String,
    /// Playbook bullets the generator claims to have used.
    pub bullet_ids: Vec<u64>,
    /// JSON `answer` field, or the last non-empty line of the reply.
    pub predicted_answer: String,
}

pub async fn generate(
    question: &str,
    playbook: &str,
    context: &str,
    reflection: &str,
    model: &str,
    client: &dyn ChatClient,
) -> anyhow::Result<Generation> {
    let prompt = GENERATOR_PROMPT
        .replace("{playbook}", playbook)
        .replace("{reflection}", or_placeholder(reflection, "No recent reflection"))
        .replace("{context}", or_placeholder(context, "No additional context"))
        .replace("{question}", question);

    let text = client
        .complete(model, &[ChatMessage::user(prompt)])
        .await
        .context("generator call failed")?;

    let bullet_ids = extract_bullet_ids(&text);
    let predicted_answer = extract_predicted_answer(&text);
    Ok(Generation {
        reasoning_trace: text,
        bullet_ids,
        predicted_answer,
    })
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

const REFLECTOR_PROMPT: &str = "\
You are the reflector agent. Judge how well the previous step went and tag \
the playbook bullets that were used.

QUESTION:
{question}

REASONING TRACE:
{reasoning_trace}

PREDICTED ANSWER:
{predicted_answer}

ENVIRONMENT FEEDBACK:
{feedback}

BULLETS USED:
{bullets_used}

Briefly analyze what worked and what did not, then end with a JSON object of \
the form {\"reflection\": \"<one-paragraph lesson>\", \"bullet_tags\": \
[{\"bullet_id\": <id>, \"tag\": \"helpful\" | \"harmful\" | \"neutral\"}]}. \
Tag every bullet listed above.";

/// Reflector verdict on the previous step.
#[derive(Debug, Clone)]
pub struct Reflection {
    /// JSON `reflection` field, or the raw reply when no JSON parses.
    pub text: String,
    pub tags: Vec<BulletTag>,
}

pub async fn reflect(
    question: &str,
    reasoning_trace: &str,
    predicted_answer: &str,
    feedback: &str,
    bullets_used: &str,
    model: &str,
    client: &dyn ChatClient,
) -> anyhow::Result<Reflection> {
    let prompt = REFLECTOR_PROMPT
        .replace("{question}", question)
        .replace("{reasoning_trace}", reasoning_trace)
        .replace("{predicted_answer}", predicted_answer)
        .replace("{feedback}", or_placeholder(feedback, "No feedback"))
        .replace("{bullets_used}", or_placeholder(bullets_used, "No bullets used"));

    let text = client
        .complete(model, &[ChatMessage::user(prompt)])
        .await
        .context("reflector call failed")?;

    let json = extract_json(&text);
    let reflection = json
        .as_ref()
        .and_then(|v| v.get("reflection"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| text.clone());
    let tags = json
        .as_ref()
        .and_then(|v| v.get("bullet_tags"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(BulletTag::from_value).collect())
        .unwrap_or_default();

    Ok(Reflection { text: reflection, tags })
}

// ---------------------------------------------------------------------------
// Curator
// ---------------------------------------------------------------------------

const CURATOR_PROMPT: &str = "\
You are the curator agent. Maintain a playbook of durable, reusable \
heuristics for a task-solving assistant.

CURRENT PLAYBOOK:
{playbook}

PLAYBOOK STATS:
{stats}

RECENT REFLECTION:
{reflection}

CURRENT TASK CONTEXT:
{question}

This is step {step}. Keep the playbook under {token_budget} tokens. Propose \
edits as a JSON object of the form {\"operations\": [{\"op\": \"ADD\", \
\"section\": \"<section name>\", \"content\": \"<new heuristic>\"}, {\"op\": \
\"REMOVE\", \"bullet_id\": <id>}, {\"op\": \"UPDATE\", \"bullet_id\": <id>, \
\"new_content\": \"<replacement text>\"}]}. Add only generalizable lessons, \
remove problematic or stale bullets, and reply {\"operations\": []} when no \
change is warranted.";

pub async fn curate(
    playbook: &str,
    stats: &PlaybookStats,
    reflection: &str,
    question: &str,
    step: u64,
    token_budget: usize,
    model: &str,
    client: &dyn ChatClient,
) -> anyhow::Result<Vec<CuratorOp>> {
    let prompt = CURATOR_PROMPT
        .replace("{playbook}", playbook)
        .replace("{stats}", &stats.to_string())
        .replace("{reflection}", or_placeholder(reflection, "No recent reflection"))
        .replace("{question}", or_placeholder(question, "No context"))
        .replace("{step}", &step.to_string())
        .replace("{token_budget}", &token_budget.to_string());

    let text = client
        .complete(model, &[ChatMessage::user(prompt)])
        .await
        .context("curator call failed")?;

    Ok(extract_operations(&text))
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Best-effort JSON extraction: the whole reply, then the first ```json
/// fence, then the first balanced `{...}` span that parses.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text.trim()) {
        return Some(v);
    }
    if let Some(block) = fenced_json_block(text) {
        if let Ok(v) = serde_json::from_str(block) {
            return Some(v);
        }
    }
    first_parsable_object(text)
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn first_parsable_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(bytes, i) {
                if let Ok(v) = serde_json::from_str(&text[i..=end]) {
                    return Some(v);
                }
            }
        }
        i += 1;
    }
    None
}

/// Index of the `}` closing the `{` at `open`, honoring string literals.
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Bullet ids from a generator reply: JSON `bullet_ids_used`, else a
/// `BULLET_IDS: [...]` marker, else the last bracketed integer list.
fn extract_bullet_ids(text: &str) -> Vec<u64> {
    if let Some(json) = extract_json(text) {
        if let Some(ids) = json.get("bullet_ids_used").and_then(Value::as_array) {
            return ids
                .iter()
                .filter_map(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
                .collect();
        }
    }
    if let Some(ids) = marker_id_list(text) {
        return ids;
    }
    last_bracketed_id_list(text).unwrap_or_default()
}

fn marker_id_list(text: &str) -> Option<Vec<u64>> {
    let at = text.find("BULLET_IDS:")?;
    let rest = &text[at + "BULLET_IDS:".len()..];
    let open = rest.find('[')?;
    if !rest[..open].trim().is_empty() {
        return None;
    }
    let close = rest[open..].find(']')? + open;
    let inner = &rest[open + 1..close];
    if inner.trim().is_empty() {
        return None;
    }
    // Non-numeric entries are skipped rather than rejecting the list.
    Some(inner.split(',').filter_map(|p| p.trim().parse().ok()).collect())
}

fn last_bracketed_id_list(text: &str) -> Option<Vec<u64>> {
    let mut result = None;
    let mut search = 0;
    while let Some(open) = text[search..].find('[').map(|i| search + i) {
        if let Some(close) = text[open + 1..].find(']').map(|i| open + 1 + i) {
            if let Some(ids) = strict_id_list(&text[open + 1..close]) {
                result = Some(ids);
            }
        }
        search = open + 1;
    }
    result
}

/// Parse `1, 2, 3` where every entry must be an integer.
fn strict_id_list(inner: &str) -> Option<Vec<u64>> {
    let mut ids = Vec::new();
    for part in inner.split(',') {
        ids.push(part.trim().parse().ok()?);
    }
    (!ids.is_empty()).then_some(ids)
}

fn extract_predicted_answer(text: &str) -> String {
    if let Some(json) = extract_json(text) {
        if let Some(answer) = json.get("answer").and_then(Value::as_str) {
            return answer.trim().to_string();
        }
    }
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

fn extract_operations(text: &str) -> Vec<CuratorOp> {
    extract_json(text)
        .and_then(|json| {
            json.get("operations")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(CuratorOp::from_value).collect())
        })
        .unwrap_or_default()
}
