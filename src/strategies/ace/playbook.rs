//! Playbook text model: parsing, formatting, and mutation of the tagged
//! heuristic bullets the ACE agents maintain.
//!
//! The canonical form is plain text. `## <Section Title>` headers group
//! bullet lines of the shape `[<id>] helpful=<h> harmful=<m> :: <content>`.
//! Everything here is pure string manipulation; the LLM-facing side lives
//! in [`super::agents`].

use std::fmt;

use serde_json::Value;

/// Starting playbook: section headers with placeholder comments, no bullets.
pub const EMPTY_PLAYBOOK: &str = "\
# Agent Playbook

## Task Decomposition & Planning (TSD)
<!-- Break complex tasks into manageable steps -->

## Error Handling & Recovery (ERR)
<!-- Detecting and recovering from errors -->

## Context & Memory Management (CTX)
<!-- Keeping the relevant context in view -->

## Reasoning Patterns (RSN)
<!-- Proven reasoning approaches and heuristics -->

## Tool Usage (TLS)
<!-- Effective use of the available tools -->

## Communication & Output (COM)
<!-- Clear and well-formed responses -->
";

// ---------------------------------------------------------------------------
// Bullets
// ---------------------------------------------------------------------------

/// One playbook bullet. The `id` is globally unique within a session and
/// never reused, even after the bullet is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bullet {
    pub id: u64,
    pub helpful: u32,
    pub harmful: u32,
    pub content: String,
}

impl Bullet {
    /// Parse a `[id] helpful=X harmful=Y :: content` line. Returns `None`
    /// for anything else (headers, prose, placeholder comments).
    pub fn parse(line: &str) -> Option<Bullet> {
        let line = line.trim();
        let rest = line.strip_prefix('[')?;
        let (id, rest) = rest.split_once(']')?;
        let id = id.trim().parse().ok()?;
        let (meta, content) = rest.split_once("::")?;

        let mut helpful = None;
        let mut harmful = None;
        for token in meta.split_whitespace() {
            if let Some(v) = token.strip_prefix("helpful=") {
                helpful = v.parse().ok();
            } else if let Some(v) = token.strip_prefix("harmful=") {
                harmful = v.parse().ok();
            }
        }

        let content = content.trim();
        if content.is_empty() {
            return None;
        }
        Some(Bullet {
            id,
            helpful: helpful?,
            harmful: harmful?,
            content: content.to_string(),
        })
    }
}

impl fmt::Display for Bullet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] helpful={} harmful={} :: {}",
            self.id, self.helpful, self.harmful, self.content
        )
    }
}

/// Reflector verdict on one bullet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Helpful,
    Harmful,
    Neutral,
}

impl Tag {
    fn parse(s: &str) -> Tag {
        match s.trim().to_ascii_lowercase().as_str() {
            "helpful" => Tag::Helpful,
            "harmful" => Tag::Harmful,
            _ => Tag::Neutral,
        }
    }
}

/// A `{bullet_id, tag}` pair extracted from a reflection.
#[derive(Debug, Clone)]
pub struct BulletTag {
    pub bullet_id: u64,
    pub tag: Tag,
}

impl BulletTag {
    /// Tolerant extraction from one JSON entry. Entries without a usable
    /// `bullet_id` are dropped; a missing or unknown `tag` means neutral.
    pub fn from_value(value: &Value) -> Option<BulletTag> {
        let bullet_id = u64_field(value, "bullet_id")?;
        let tag = value
            .get("tag")
            .and_then(Value::as_str)
            .map(Tag::parse)
            .unwrap_or(Tag::Neutral);
        Some(BulletTag { bullet_id, tag })
    }
}

/// Bump helpful/harmful counts for the tagged bullets. Neutral tags and ids
/// that match no bullet are no-ops; every other line passes through as-is.
pub fn update_counts(playbook: &str, tags: &[BulletTag]) -> String {
    playbook
        .lines()
        .map(|line| {
            let Some(mut bullet) = Bullet::parse(line) else {
                return line.to_string();
            };
            let Some(tag) = tags.iter().find(|t| t.bullet_id == bullet.id) else {
                return line.to_string();
            };
            match tag.tag {
                Tag::Helpful => bullet.helpful += 1,
                Tag::Harmful => bullet.harmful += 1,
                Tag::Neutral => {}
            }
            bullet.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Curator operations
// ---------------------------------------------------------------------------

/// One edit proposed by the Curator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CuratorOp {
    Add { section: String, content: String },
    Remove { bullet_id: u64 },
    Update { bullet_id: u64, new_content: String },
}

impl CuratorOp {
    /// Tolerant extraction from one JSON entry. Unknown op names, empty ADD
    /// content, and missing ids are dropped rather than erroring, since the
    /// source is unvalidated LLM output.
    pub fn from_value(value: &Value) -> Option<CuratorOp> {
        let op = value.get("op")?.as_str()?.trim().to_ascii_uppercase();
        match op.as_str() {
            "ADD" => {
                let content = str_field(value, "content");
                if content.is_empty() {
                    return None;
                }
                Some(CuratorOp::Add {
                    section: str_field(value, "section"),
                    content,
                })
            }
            "REMOVE" => Some(CuratorOp::Remove {
                bullet_id: u64_field(value, "bullet_id")?,
            }),
            "UPDATE" => {
                let new_content = str_field(value, "new_content");
                if new_content.is_empty() {
                    return None;
                }
                Some(CuratorOp::Update {
                    bullet_id: u64_field(value, "bullet_id")?,
                    new_content,
                })
            }
            _ => None,
        }
    }
}

/// Apply curator operations in order against the playbook text.
///
/// ADD inserts right after the matching section header (skipping `<!--`
/// placeholder lines), appending a new `## <section>` header when no
/// section matches, and consumes one id from the counter. REMOVE deletes
/// the bullet line. UPDATE rewrites content, keeping counts. Returns the
/// new text and the next unassigned id.
pub fn apply_operations(playbook: &str, operations: &[CuratorOp], next_id: u64) -> (String, u64) {
    let mut lines: Vec<String> = playbook.lines().map(str::to_string).collect();
    let mut next_id = next_id;

    for op in operations {
        match op {
            CuratorOp::Add { section, content } => {
                let bullet = Bullet {
                    id: next_id,
                    helpful: 0,
                    harmful: 0,
                    content: content.clone(),
                };
                insert_bullet(&mut lines, section, bullet.to_string());
                next_id += 1;
            }
            CuratorOp::Remove { bullet_id } => {
                lines.retain(|line| Bullet::parse(line).map_or(true, |b| b.id != *bullet_id));
            }
            CuratorOp::Update {
                bullet_id,
                new_content,
            } => {
                for line in lines.iter_mut() {
                    if let Some(mut bullet) = Bullet::parse(line) {
                        if bullet.id == *bullet_id {
                            bullet.content = new_content.clone();
                            *line = bullet.to_string();
                            break;
                        }
                    }
                }
            }
        }
    }

    (lines.join("\n"), next_id)
}

fn insert_bullet(lines: &mut Vec<String>, section: &str, bullet_line: String) {
    let slug_marker = format!("({})", section_slug(section));
    let section_lower = section.to_lowercase();

    let header = lines.iter().position(|line| {
        line.starts_with("##")
            && (line.contains(&slug_marker) || line.to_lowercase().contains(&section_lower))
    });

    match header {
        Some(at) => {
            let mut insert = at + 1;
            while insert < lines.len() && lines[insert].trim().starts_with("<!--") {
                insert += 1;
            }
            lines.insert(insert, bullet_line);
        }
        None => {
            lines.push(String::new());
            lines.push(format!("## {section}"));
            lines.push(bullet_line);
        }
    }
}

/// Three-letter slug for a section title, `GEN` for anything unrecognized.
pub fn section_slug(section: &str) -> &'static str {
    match section.trim().to_lowercase().replace('_', " ").as_str() {
        "task decomposition" | "task decomposition & planning" => "TSD",
        "error handling" | "error handling & recovery" => "ERR",
        "context management" | "context & memory management" => "CTX",
        "reasoning patterns" => "RSN",
        "tool usage" => "TLS",
        "communication" | "communication & output" => "COM",
        _ => "GEN",
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Aggregate counts over the current bullets, reported to the Curator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybookStats {
    pub total: usize,
    pub high_performing: usize,
    pub problematic: usize,
    pub unused: usize,
}

impl fmt::Display for PlaybookStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total bullets: {}, high performing: {}, problematic: {}, unused: {}",
            self.total, self.high_performing, self.problematic, self.unused
        )
    }
}

/// Compute [`PlaybookStats`] from the playbook text.
pub fn stats(playbook: &str) -> PlaybookStats {
    let mut out = PlaybookStats::default();
    for bullet in playbook.lines().filter_map(Bullet::parse) {
        out.total += 1;
        if bullet.helpful >= 3 && bullet.harmful == 0 {
            out.high_performing += 1;
        }
        if bullet.harmful >= 2 {
            out.problematic += 1;
        }
        if bullet.helpful == 0 && bullet.harmful == 0 {
            out.unused += 1;
        }
    }
    out
}

/// The bullet lines matching `ids`, newline-joined. Empty when none match.
pub fn bullets_by_id(playbook: &str, ids: &[u64]) -> String {
    playbook
        .lines()
        .filter(|line| Bullet::parse(line).is_some_and(|b| ids.contains(&b.id)))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// JSON field helpers
// ---------------------------------------------------------------------------

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    let field = value.get(key)?;
    field
        .as_u64()
        .or_else(|| field.as_str()?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_bullet_lines() {
        let b = Bullet::parse("[12] helpful=3 harmful=1 :: verify ids before acting").unwrap();
        assert_eq!(b.id, 12);
        assert_eq!(b.helpful, 3);
        assert_eq!(b.harmful, 1);
        assert_eq!(b.content, "verify ids before acting");
        assert_eq!(
            b.to_string(),
            "[12] helpful=3 harmful=1 :: verify ids before acting"
        );
    }

    #[test]
    fn rejects_non_bullet_lines() {
        assert!(Bullet::parse("## Tool Usage (TLS)").is_none());
        assert!(Bullet::parse("<!-- placeholder -->").is_none());
        assert!(Bullet::parse("[x] helpful=0 harmful=0 :: bad id").is_none());
        assert!(Bullet::parse("[3] helpful=a harmful=0 :: bad count").is_none());
        assert!(Bullet::parse("[3] helpful=0 harmful=0 ::").is_none());
        assert!(Bullet::parse("plain prose with [3] inside").is_none());
    }

    #[test]
    fn content_may_contain_double_colons() {
        let b = Bullet::parse("[1] helpful=0 harmful=0 :: prefer a::b paths").unwrap();
        assert_eq!(b.content, "prefer a::b paths");
    }

    #[test]
    fn update_counts_applies_tags() {
        let playbook = "## Tool Usage (TLS)\n\
                        [1] helpful=0 harmful=0 :: check args\n\
                        [2] helpful=1 harmful=0 :: retry once\n\
                        [3] helpful=0 harmful=1 :: guess freely";
        let tags = vec![
            BulletTag { bullet_id: 1, tag: Tag::Helpful },
            BulletTag { bullet_id: 2, tag: Tag::Neutral },
            BulletTag { bullet_id: 3, tag: Tag::Harmful },
            BulletTag { bullet_id: 99, tag: Tag::Helpful },
        ];
        let updated = update_counts(playbook, &tags);
        assert!(updated.contains("[1] helpful=1 harmful=0 :: check args"));
        assert!(updated.contains("[2] helpful=1 harmful=0 :: retry once"));
        assert!(updated.contains("[3] helpful=0 harmful=2 :: guess freely"));
    }

    #[test]
    fn add_inserts_after_section_header() {
        let ops = vec![CuratorOp::Add {
            section: "tool_usage".into(),
            content: "read the schema first".into(),
        }];
        let (updated, next_id) = apply_operations(EMPTY_PLAYBOOK, &ops, 1);
        assert_eq!(next_id, 2);

        let lines: Vec<&str> = updated.lines().collect();
        let header = lines
            .iter()
            .position(|l| l.starts_with("## Tool Usage"))
            .unwrap();
        // Header, placeholder comment, then the new bullet.
        assert_eq!(lines[header + 2], "[1] helpful=0 harmful=0 :: read the schema first");
    }

    #[test]
    fn add_to_unknown_section_appends_header() {
        let ops = vec![CuratorOp::Add {
            section: "Browser Automation".into(),
            content: "wait for selectors".into(),
        }];
        let (updated, _) = apply_operations(EMPTY_PLAYBOOK, &ops, 7);
        assert!(updated.contains("## Browser Automation"));
        assert!(updated.ends_with("[7] helpful=0 harmful=0 :: wait for selectors"));
    }

    #[test]
    fn ids_are_never_reused_after_remove() {
        let (p1, n1) = apply_operations(
            EMPTY_PLAYBOOK,
            &[
                CuratorOp::Add { section: "reasoning patterns".into(), content: "a".into() },
                CuratorOp::Add { section: "reasoning patterns".into(), content: "b".into() },
            ],
            1,
        );
        assert_eq!(n1, 3);

        let (p2, n2) = apply_operations(&p1, &[CuratorOp::Remove { bullet_id: 1 }], n1);
        assert_eq!(n2, 3);
        assert!(!p2.contains("[1]"));

        let (p3, n3) = apply_operations(
            &p2,
            &[CuratorOp::Add { section: "reasoning patterns".into(), content: "c".into() }],
            n2,
        );
        assert_eq!(n3, 4);
        assert!(p3.contains("[3] helpful=0 harmful=0 :: c"));
        assert!(!p3.contains("[1]"));
    }

    #[test]
    fn update_preserves_counts() {
        let playbook = "## Reasoning Patterns (RSN)\n[4] helpful=2 harmful=1 :: old text";
        let ops = vec![CuratorOp::Update { bullet_id: 4, new_content: "new text".into() }];
        let (updated, next_id) = apply_operations(playbook, &ops, 5);
        assert_eq!(next_id, 5);
        assert!(updated.contains("[4] helpful=2 harmful=1 :: new text"));
        assert!(!updated.contains("old text"));
    }

    #[test]
    fn stats_classifies_bullets() {
        let playbook = "## Tool Usage (TLS)\n\
                        [1] helpful=3 harmful=0 :: strong\n\
                        [2] helpful=1 harmful=2 :: risky\n\
                        [3] helpful=0 harmful=0 :: untried";
        let s = stats(playbook);
        assert_eq!(s.total, 3);
        assert_eq!(s.high_performing, 1);
        assert_eq!(s.problematic, 1);
        assert_eq!(s.unused, 1);
        assert_eq!(stats(EMPTY_PLAYBOOK), PlaybookStats::default());
    }

    #[test]
    fn bullets_by_id_extracts_matching_lines() {
        let playbook = "## Tool Usage (TLS)\n\
                        [1] helpful=0 harmful=0 :: one\n\
                        [2] helpful=0 harmful=0 :: two";
        assert_eq!(bullets_by_id(playbook, &[2]), "[2] helpful=0 harmful=0 :: two");
        assert_eq!(bullets_by_id(playbook, &[9]), "");
        assert_eq!(bullets_by_id(playbook, &[]), "");
    }

    #[test]
    fn curator_ops_parse_tolerantly() {
        let add = CuratorOp::from_value(&json!({
            "op": "add", "section": "Tool Usage", "content": "x"
        }));
        assert_eq!(
            add,
            Some(CuratorOp::Add { section: "Tool Usage".into(), content: "x".into() })
        );

        let remove = CuratorOp::from_value(&json!({"op": "REMOVE", "bullet_id": "7"}));
        assert_eq!(remove, Some(CuratorOp::Remove { bullet_id: 7 }));

        assert!(CuratorOp::from_value(&json!({"op": "ADD", "section": "s"})).is_none());
        assert!(CuratorOp::from_value(&json!({"op": "REMOVE"})).is_none());
        assert!(CuratorOp::from_value(&json!({"op": "ARCHIVE", "bullet_id": 1})).is_none());
        assert!(CuratorOp::from_value(&json!({"op": "UPDATE", "bullet_id": 1})).is_none());
    }

    #[test]
    fn bullet_tags_parse_tolerantly() {
        let tag = BulletTag::from_value(&json!({"bullet_id": 3, "tag": "harmful"})).unwrap();
        assert_eq!(tag.bullet_id, 3);
        assert_eq!(tag.tag, Tag::Harmful);

        let defaulted = BulletTag::from_value(&json!({"bullet_id": "4"})).unwrap();
        assert_eq!(defaulted.tag, Tag::Neutral);

        let unknown = BulletTag::from_value(&json!({"bullet_id": 5, "tag": "meh"})).unwrap();
        assert_eq!(unknown.tag, Tag::Neutral);

        assert!(BulletTag::from_value(&json!({"tag": "helpful"})).is_none());
    }

    #[test]
    fn section_slugs_cover_template_sections() {
        assert_eq!(section_slug("task_decomposition"), "TSD");
        assert_eq!(section_slug("Error Handling & Recovery"), "ERR");
        assert_eq!(section_slug("context management"), "CTX");
        assert_eq!(section_slug("Reasoning Patterns"), "RSN");
        assert_eq!(section_slug("tool usage"), "TLS");
        assert_eq!(section_slug("Communication"), "COM");
        assert_eq!(section_slug("something else"), "GEN");
    }
}
